//! Certificate sources for TLS termination
//!
//! The terminator asks a [`CertificateSource`] for a certificate every time a
//! client announces a server name. Sources decide how certificates are
//! obtained and whether they are cached:
//! - [`LocalApiCertificates`] asks the overlay daemon (`tailscaled`) over its
//!   local API socket, which provisions and caches certificates itself
//! - [`DirectoryCertificates`] reads `<name>.crt` / `<name>.key` PEM files
//! - [`SelfSignedCertificates`] generates and memoizes a self-signed
//!   certificate per name, for local debugging

use crate::config::{CertSourceKind, ProxyConfig};
use async_trait::async_trait;
use rcgen::{generate_simple_self_signed, CertifiedKey as GeneratedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Errors from certificate lookups
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("no certificate for {0}")]
    NotFound(String),

    #[error("certificate for {0} has expired")]
    Expired(String),

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PEM data: {0}")]
    Pem(String),

    #[error("local API request failed: {0}")]
    LocalApi(String),

    #[error("failed to generate certificate: {0}")]
    Generate(String),
}

/// A certificate chain and its private key
#[derive(Debug)]
pub struct CertificateRecord {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for CertificateRecord {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl CertificateRecord {
    /// Parse a certificate chain and a private key from separate PEM blobs
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertificateError> {
        let (chain, _) = parse_pem(cert_pem)?;
        let (_, key) = parse_pem(key_pem)?;
        Self::from_parts(chain, key)
    }

    /// Parse a single PEM blob holding both the key and the chain, in any order
    pub fn from_combined_pem(pem: &[u8]) -> Result<Self, CertificateError> {
        let (chain, key) = parse_pem(pem)?;
        Self::from_parts(chain, key)
    }

    fn from_parts(
        chain: Vec<CertificateDer<'static>>,
        key: Option<PrivateKeyDer<'static>>,
    ) -> Result<Self, CertificateError> {
        if chain.is_empty() {
            return Err(CertificateError::Pem("no certificates found".to_string()));
        }
        let key = key.ok_or_else(|| CertificateError::Pem("no private key found".to_string()))?;
        Ok(Self { chain, key })
    }

    /// Whether the leaf certificate is still within its validity period
    pub fn is_current(&self) -> bool {
        self.chain.first().map(is_cert_current).unwrap_or(false)
    }
}

/// Resolves a requested server name to a certificate.
///
/// Called once per TLS handshake and possibly from many connections at once.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn get_certificate(&self, server_name: &str) -> Result<CertificateRecord, CertificateError>;
}

/// Build the certificate source selected in `config`
pub fn from_config(config: &ProxyConfig) -> anyhow::Result<Arc<dyn CertificateSource>> {
    let source: Arc<dyn CertificateSource> = match config.tls.source {
        CertSourceKind::LocalApi => local_api_source(&config.tls.socket)?,
        CertSourceKind::Dir => {
            let dir = config.cert_dir();
            info!(dir = %dir.display(), "Loading certificates from directory");
            Arc::new(DirectoryCertificates::new(dir))
        }
        CertSourceKind::SelfSigned => {
            info!("Using self-signed certificates (not for production)");
            Arc::new(SelfSignedCertificates::new())
        }
    };
    Ok(source)
}

#[cfg(unix)]
fn local_api_source(socket: &Path) -> anyhow::Result<Arc<dyn CertificateSource>> {
    info!(socket = %socket.display(), "Fetching certificates from the local API");
    Ok(Arc::new(LocalApiCertificates::new(socket)))
}

#[cfg(not(unix))]
fn local_api_source(_socket: &Path) -> anyhow::Result<Arc<dyn CertificateSource>> {
    anyhow::bail!("the local-api certificate source requires a unix socket; use dir or self-signed")
}

/// Reject names that cannot be DNS names or would escape a directory
fn validate_server_name(name: &str) -> Result<(), CertificateError> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*');
    if valid {
        Ok(())
    } else {
        Err(CertificateError::InvalidServerName(name.to_string()))
    }
}

/// Reads `<dir>/<name>.crt` and `<dir>/<name>.key` on every lookup so that
/// renewed files are picked up without a restart
#[derive(Debug, Clone)]
pub struct DirectoryCertificates {
    dir: PathBuf,
}

impl DirectoryCertificates {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CertificateSource for DirectoryCertificates {
    async fn get_certificate(&self, server_name: &str) -> Result<CertificateRecord, CertificateError> {
        validate_server_name(server_name)?;
        let name = server_name.to_ascii_lowercase();
        let cert_path = self.dir.join(format!("{}.crt", name));
        let key_path = self.dir.join(format!("{}.key", name));

        let cert_pem = read_file(&cert_path, &name).await?;
        let key_pem = read_file(&key_path, &name).await?;

        let record = CertificateRecord::from_pem(&cert_pem, &key_pem)?;
        if !record.is_current() {
            return Err(CertificateError::Expired(name));
        }

        debug!(server_name = %name, path = %cert_path.display(), "Loaded certificate");
        Ok(record)
    }
}

async fn read_file(path: &Path, name: &str) -> Result<Vec<u8>, CertificateError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CertificateError::NotFound(name.to_string()))
        }
        Err(source) => Err(CertificateError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Names a [`SelfSignedCertificates`] source issues certificates for by default
pub const DEFAULT_SELF_SIGNED_LIMIT: usize = 16;

/// Generates a self-signed certificate the first time a name is requested and
/// keeps it for the life of the process. Server names come from clients, so
/// only the first `limit` distinct names are served.
#[derive(Debug)]
pub struct SelfSignedCertificates {
    cache: parking_lot::Mutex<HashMap<String, CertificateRecord>>,
    limit: usize,
}

impl Default for SelfSignedCertificates {
    fn default() -> Self {
        Self::with_limit(DEFAULT_SELF_SIGNED_LIMIT)
    }
}

impl SelfSignedCertificates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            cache: parking_lot::Mutex::new(HashMap::new()),
            limit,
        }
    }
}

#[async_trait]
impl CertificateSource for SelfSignedCertificates {
    async fn get_certificate(&self, server_name: &str) -> Result<CertificateRecord, CertificateError> {
        validate_server_name(server_name)?;
        let name = server_name.to_ascii_lowercase();

        {
            let cache = self.cache.lock();
            if let Some(record) = cache.get(&name) {
                return Ok(record.clone());
            }
            if cache.len() >= self.limit {
                warn!(server_name = %name, limit = self.limit, "Self-signed certificate limit reached");
                return Err(CertificateError::NotFound(name));
            }
        }

        let record = generate_self_signed(&name)?;
        let mut cache = self.cache.lock();
        if let Some(record) = cache.get(&name) {
            return Ok(record.clone());
        }
        if cache.len() >= self.limit {
            return Err(CertificateError::NotFound(name));
        }
        debug!(server_name = %name, "Generated self-signed certificate");
        cache.insert(name, record.clone());
        Ok(record)
    }
}

/// Generate a self-signed certificate valid for `name`
pub fn generate_self_signed(name: &str) -> Result<CertificateRecord, CertificateError> {
    let GeneratedKey { cert, key_pair } = generate_simple_self_signed(vec![name.to_string()])
        .map_err(|e| CertificateError::Generate(e.to_string()))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| CertificateError::Generate(e.to_string()))?;

    Ok(CertificateRecord {
        chain: vec![cert_der],
        key: key_der,
    })
}

#[cfg(unix)]
pub use local_api::LocalApiCertificates;

#[cfg(unix)]
mod local_api {
    use super::{validate_server_name, CertificateError, CertificateRecord, CertificateSource};
    use async_trait::async_trait;
    use http_body_util::{BodyExt, Empty};
    use hyper::body::Bytes;
    use hyper::{Method, Request};
    use hyper_util::rt::TokioIo;
    use std::path::{Path, PathBuf};
    use tokio::net::UnixStream;
    use tracing::debug;

    /// Host header the daemon expects on local API requests
    const LOCAL_API_HOST: &str = "local-tailscaled.sock";

    /// Fetches certificates from `tailscaled` over its local API socket.
    ///
    /// The daemon obtains certificates for the node's overlay name on demand
    /// and caches them, so no caching happens here.
    #[derive(Debug, Clone)]
    pub struct LocalApiCertificates {
        socket: PathBuf,
    }

    impl LocalApiCertificates {
        pub fn new(socket: impl AsRef<Path>) -> Self {
            Self {
                socket: socket.as_ref().to_path_buf(),
            }
        }

        async fn fetch_pair(&self, server_name: &str) -> Result<Bytes, CertificateError> {
            let stream = UnixStream::connect(&self.socket)
                .await
                .map_err(|source| CertificateError::Io {
                    path: self.socket.clone(),
                    source,
                })?;

            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| CertificateError::LocalApi(e.to_string()))?;

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "Local API connection closed with error");
                }
            });

            let req = Request::builder()
                .method(Method::GET)
                .uri(format!("/localapi/v0/cert/{}?type=pair", server_name))
                .header(hyper::header::HOST, LOCAL_API_HOST)
                .header("Sec-Tailscale", "localapi")
                .body(Empty::<Bytes>::new())
                .map_err(|e| CertificateError::LocalApi(e.to_string()))?;

            let response = sender
                .send_request(req)
                .await
                .map_err(|e| CertificateError::LocalApi(e.to_string()))?;

            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| CertificateError::LocalApi(e.to_string()))?
                .to_bytes();

            if !status.is_success() {
                return Err(CertificateError::LocalApi(format!(
                    "{}: {}",
                    status,
                    String::from_utf8_lossy(&body).trim()
                )));
            }

            Ok(body)
        }
    }

    #[async_trait]
    impl CertificateSource for LocalApiCertificates {
        async fn get_certificate(&self, server_name: &str) -> Result<CertificateRecord, CertificateError> {
            validate_server_name(server_name)?;
            let pair = self.fetch_pair(server_name).await?;
            debug!(server_name, bytes = pair.len(), "Fetched certificate from local API");
            let record = CertificateRecord::from_combined_pem(&pair)?;
            if !record.is_current() {
                return Err(CertificateError::Expired(server_name.to_string()));
            }
            Ok(record)
        }
    }
}

fn parse_pem(
    data: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, Option<PrivateKeyDer<'static>>), CertificateError> {
    let mut reader = BufReader::new(data);
    let mut certs = Vec::new();
    let mut key = None;

    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|e| CertificateError::Pem(e.to_string()))? {
            rustls_pemfile::Item::X509Certificate(cert) => certs.push(cert),
            rustls_pemfile::Item::Pkcs1Key(k) if key.is_none() => key = Some(k.into()),
            rustls_pemfile::Item::Pkcs8Key(k) if key.is_none() => key = Some(k.into()),
            rustls_pemfile::Item::Sec1Key(k) if key.is_none() => key = Some(k.into()),
            _ => continue,
        }
    }

    Ok((certs, key))
}

fn is_cert_current(cert: &CertificateDer<'_>) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            debug!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let validity = parsed.validity();
    let current = validity.is_valid();
    if !current {
        debug!(
            not_before = %validity.not_before,
            not_after = %validity.not_after,
            "Certificate outside its validity period"
        );
    }
    current
}
