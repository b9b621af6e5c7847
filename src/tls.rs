//! TLS termination with per-handshake certificate lookup

use crate::certs::{CertificateError, CertificateRecord, CertificateSource};
use rustls::crypto::CryptoProvider;
use rustls::server::Acceptor;
use rustls::ServerConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

/// Errors that end a TLS handshake
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS handshake failed")]
    Handshake(#[source] std::io::Error),

    #[error("client did not send a server name")]
    MissingServerName,

    #[error("certificate lookup for {server_name} failed")]
    Certificate {
        server_name: String,
        #[source]
        source: CertificateError,
    },

    #[error("unusable certificate for {server_name}")]
    Config {
        server_name: String,
        #[source]
        source: rustls::Error,
    },
}

/// Terminates TLS on accepted streams, asking a [`CertificateSource`] for the
/// certificate matching the server name in each ClientHello
#[derive(Clone)]
pub struct TlsTerminator {
    certificates: Arc<dyn CertificateSource>,
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for TlsTerminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTerminator")
            .field("certificates", &"<dyn CertificateSource>")
            .finish()
    }
}

impl TlsTerminator {
    pub fn new(certificates: Arc<dyn CertificateSource>) -> Self {
        Self {
            certificates,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Perform the server side of the handshake on `stream`.
    ///
    /// The certificate record is used for this handshake only; caching is up
    /// to the certificate source.
    pub async fn terminate<IO>(&self, stream: IO) -> Result<TlsStream<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(TlsError::Handshake)?;

        let server_name = start
            .client_hello()
            .server_name()
            .ok_or(TlsError::MissingServerName)?
            .to_string();

        let record = self
            .certificates
            .get_certificate(&server_name)
            .await
            .map_err(|source| TlsError::Certificate {
                server_name: server_name.clone(),
                source,
            })?;

        let config = self
            .server_config(record)
            .map_err(|source| TlsError::Config {
                server_name: server_name.clone(),
                source,
            })?;

        let stream = start
            .into_stream(Arc::new(config))
            .await
            .map_err(TlsError::Handshake)?;

        debug!(server_name, "TLS handshake complete");
        Ok(stream)
    }

    fn server_config(&self, record: CertificateRecord) -> Result<ServerConfig, rustls::Error> {
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(record.chain, record.key)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}
