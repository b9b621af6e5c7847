use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Port on which TLS termination is enabled
pub const TLS_PORT: u16 = 443;

/// Errors found while turning a [`Config`] into a [`ProxyConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("a backend URL is required (--proxy)")]
    MissingBackend,

    #[error("invalid backend URL '{url}': {reason}")]
    InvalidBackend { url: String, reason: String },

    #[error("invalid listen address '{0}': expected [host]:port")]
    InvalidListenAddr(String),

    #[error("invalid hostname '{0}': use letters, digits and '-' only")]
    InvalidHostname(String),

    #[error("listen address {0} is not port 443; set plaintext to serve unencrypted HTTP")]
    PlaintextNotEnabled(ListenAddr),

    #[error("no user configuration directory available for the state directory")]
    NoStateDir,
}

/// Where the TLS terminator gets its certificates from
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CertSourceKind {
    /// Ask the overlay daemon's local API for a certificate per server name
    #[default]
    LocalApi,
    /// Read `<name>.crt` and `<name>.key` from a directory
    Dir,
    /// Generate a self-signed certificate per server name (debugging only)
    SelfSigned,
}

/// Certificate source settings
#[derive(Debug, Deserialize, Clone)]
pub struct TlsSettings {
    /// Certificate source (default: local-api)
    #[serde(default)]
    pub source: CertSourceKind,

    /// Directory for the `dir` source (default: `<state dir>/certs`)
    pub cert_dir: Option<PathBuf>,

    /// Local API unix socket for the `local-api` source
    #[serde(default = "default_local_api_socket")]
    pub socket: PathBuf,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            source: CertSourceKind::default(),
            cert_dir: None,
            socket: default_local_api_socket(),
        }
    }
}

/// File configuration for the proxy. Every field has a default so an empty
/// file (or no file) is valid; the backend URL is checked in
/// [`ProxyConfig::from_config`].
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address to listen on (default: ":443")
    #[serde(default = "default_listen_addr")]
    pub addr: String,

    /// Service identity name on the overlay (default: "tsrproxy")
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// URL of the backend to reverse proxy
    pub proxy: Option<String>,

    /// Backend connect/response timeout in milliseconds (0 disables it)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Verbose logging
    #[serde(default)]
    pub verbose: bool,

    /// Allow serving plaintext HTTP when the listen port is not 443
    #[serde(default)]
    pub plaintext: bool,

    #[serde(default)]
    pub tls: TlsSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
            hostname: default_hostname(),
            proxy: None,
            timeout_ms: default_timeout_ms(),
            verbose: false,
            plaintext: false,
            tls: TlsSettings::default(),
        }
    }
}

fn default_listen_addr() -> String {
    ":443".to_string()
}

fn default_hostname() -> String {
    "tsrproxy".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_local_api_socket() -> PathBuf {
    PathBuf::from("/var/run/tailscale/tailscaled.sock")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// A Go-style listen address: `host:port`, where an empty host means every
/// interface (":443").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl ListenAddr {
    pub fn is_tls_port(&self) -> bool {
        self.port == TLS_PORT
    }
}

impl FromStr for ListenAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidListenAddr(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.contains(':') && !s.starts_with('[') {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The single backend every request is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOrigin {
    scheme: String,
    authority: String,
    path_prefix: String,
    query: Option<String>,
}

impl BackendOrigin {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host with the port when one was given explicitly; used as the
    /// outbound `Host` header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Build the outbound target for an inbound path and query.
    pub fn target(&self, path: &str, query: Option<&str>) -> String {
        let path = join_path(&self.path_prefix, path);
        let query = merge_query(self.query.as_deref(), query);
        match query {
            Some(q) => format!("{}://{}{}?{}", self.scheme, self.authority, path, q),
            None => format!("{}://{}{}", self.scheme, self.authority, path),
        }
    }
}

impl FromStr for BackendOrigin {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidBackend {
            url: s.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(s).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid("scheme must be http or https"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            authority,
            path_prefix: url.path().to_string(),
            query: url.query().filter(|q| !q.is_empty()).map(String::from),
        })
    }
}

impl fmt::Display for BackendOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target("", None))
    }
}

/// Join two URL paths with exactly one slash between them.
fn join_path(prefix: &str, path: &str) -> String {
    if path.is_empty() {
        return if prefix.is_empty() { "/".to_string() } else { prefix.to_string() };
    }
    match (prefix.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", prefix, &path[1..]),
        (false, false) => format!("{}/{}", prefix, path),
        _ => format!("{}{}", prefix, path),
    }
}

fn merge_query(base: Option<&str>, query: Option<&str>) -> Option<String> {
    match (base.filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
        (Some(b), Some(q)) => Some(format!("{}&{}", b, q)),
        (Some(b), None) => Some(b.to_string()),
        (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    }
}

/// How accepted connections are served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    Tls,
    Plaintext,
}

/// Validated, immutable configuration shared by every connection handler
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: ListenAddr,
    pub hostname: String,
    pub backend: BackendOrigin,
    /// `None` disables the backend deadline
    pub timeout: Option<Duration>,
    pub verbose: bool,
    pub mode: ServeMode,
    pub tls: TlsSettings,
    pub state_dir: PathBuf,
}

impl ProxyConfig {
    /// Validate `config`, deriving the state directory from the user's
    /// configuration directory.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::build(config, || dirs_next::config_dir().ok_or(ConfigError::NoStateDir))
    }

    /// Like [`ProxyConfig::from_config`] with an explicit base directory.
    pub fn from_config_in(config: &Config, base_dir: &Path) -> Result<Self, ConfigError> {
        Self::build(config, || Ok(base_dir.to_path_buf()))
    }

    /// Validate every setting before resolving the base directory, so a
    /// missing backend is reported even when there is no config directory.
    fn build(
        config: &Config,
        base_dir: impl FnOnce() -> Result<PathBuf, ConfigError>,
    ) -> Result<Self, ConfigError> {
        let backend: BackendOrigin = config
            .proxy
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingBackend)?
            .parse()?;

        let listen_addr: ListenAddr = config.addr.parse()?;

        let mode = if listen_addr.is_tls_port() {
            ServeMode::Tls
        } else if config.plaintext {
            ServeMode::Plaintext
        } else {
            return Err(ConfigError::PlaintextNotEnabled(listen_addr));
        };

        validate_hostname(&config.hostname)?;

        let timeout = match config.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Self {
            listen_addr,
            hostname: config.hostname.clone(),
            backend,
            timeout,
            verbose: config.verbose,
            mode,
            tls: config.tls.clone(),
            state_dir: state_dir(&base_dir()?, &config.hostname),
        })
    }

    /// Directory used by the `dir` certificate source
    pub fn cert_dir(&self) -> PathBuf {
        self.tls
            .cert_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("certs"))
    }
}

/// Maximum hostname length per DNS label rules
const MAX_HOSTNAME_LEN: usize = 63;

fn validate_hostname(hostname: &str) -> Result<(), ConfigError> {
    let valid = !hostname.is_empty()
        && hostname.len() <= MAX_HOSTNAME_LEN
        && !hostname.starts_with('-')
        && hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidHostname(hostname.to_string()))
    }
}

fn state_dir(base: &Path, hostname: &str) -> PathBuf {
    base.join(format!("tsnet-tsrproxy-{}", hostname))
}
