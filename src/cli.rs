use crate::config::{CertSourceKind, Config};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Command line for the proxy. Every flag can also be set through a
/// `TSRPROXY_*` environment variable and overrides the config file.
#[derive(Parser, Debug, Default)]
#[command(name = "tsrproxy")]
#[command(version, about = "Reverse proxy a single backend over an overlay network with automatic TLS", long_about = None)]
pub struct Cli {
    /// Optional TOML configuration file
    #[arg(short, long, env = "TSRPROXY_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address to listen on [default: :443]
    #[arg(long, env = "TSRPROXY_ADDR")]
    pub addr: Option<String>,

    /// Hostname for the reverse proxy [default: tsrproxy]
    #[arg(long, env = "TSRPROXY_HOSTNAME")]
    pub hostname: Option<String>,

    /// URL to reverse proxy (required)
    #[arg(long, env = "TSRPROXY_PROXY", value_name = "URL")]
    pub proxy: Option<String>,

    /// Timeout for connecting to the backend, e.g. "2s" or "500ms"; "0s" disables it [default: 2s]
    #[arg(long, env = "TSRPROXY_TIMEOUT", value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Log debug output from the proxy and its transport
    #[arg(short, long, env = "TSRPROXY_VERBOSE")]
    pub verbose: bool,

    /// Serve plaintext HTTP when the listen port is not 443
    #[arg(long, env = "TSRPROXY_PLAINTEXT")]
    pub plaintext: bool,

    /// Certificate source for TLS termination [default: local-api]
    #[arg(long, env = "TSRPROXY_CERTS", value_enum)]
    pub certs: Option<CertSourceKind>,

    /// Certificate directory for the "dir" source
    #[arg(long, env = "TSRPROXY_CERT_DIR", value_name = "PATH")]
    pub cert_dir: Option<PathBuf>,

    /// Local API socket for the "local-api" source
    #[arg(long, env = "TSRPROXY_SOCKET", value_name = "PATH")]
    pub socket: Option<PathBuf>,
}

impl Cli {
    /// Load the config file (if any) and apply the command line on top
    pub fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .map_err(|e| anyhow::anyhow!("Failed to load config file {}: {}", path.display(), e))?,
            None => Config::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    /// Override `config` with every flag that was given
    pub fn apply(&self, config: &mut Config) {
        if let Some(addr) = &self.addr {
            config.addr = addr.clone();
        }
        if let Some(hostname) = &self.hostname {
            config.hostname = hostname.clone();
        }
        if let Some(proxy) = &self.proxy {
            config.proxy = Some(proxy.clone());
        }
        if let Some(timeout) = self.timeout {
            config.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        }
        if self.verbose {
            config.verbose = true;
        }
        if self.plaintext {
            config.plaintext = true;
        }
        if let Some(source) = self.certs {
            config.tls.source = source;
        }
        if let Some(dir) = &self.cert_dir {
            config.tls.cert_dir = Some(dir.clone());
        }
        if let Some(socket) = &self.socket {
            config.tls.socket = socket.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let mut config: Config = toml::from_str(
            r#"
addr = ":8443"
hostname = "from-file"
proxy = "http://file:1"
timeout_ms = 9000
"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "tsrproxy",
            "--hostname",
            "from-flag",
            "--proxy",
            "http://127.0.0.1:3000",
            "--timeout",
            "750ms",
            "--certs",
            "self-signed",
        ])
        .unwrap();
        cli.apply(&mut config);

        assert_eq!(config.addr, ":8443");
        assert_eq!(config.hostname, "from-flag");
        assert_eq!(config.proxy.as_deref(), Some("http://127.0.0.1:3000"));
        assert_eq!(config.timeout_ms, 750);
        assert_eq!(config.tls.source, CertSourceKind::SelfSigned);
    }

    #[test]
    fn test_no_flags_keeps_defaults() {
        let cli = Cli::default();
        let config = cli.load_config().unwrap();
        assert_eq!(config.addr, ":443");
        assert_eq!(config.timeout_ms, 2000);
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_zero_timeout_flag() {
        let cli = Cli::try_parse_from(["tsrproxy", "--timeout", "0s"]).unwrap();
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.timeout_ms, 0);
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        assert!(Cli::try_parse_from(["tsrproxy", "--timeout", "soon"]).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsrproxy.toml");
        std::fs::write(&path, "proxy = \"http://127.0.0.1:9000\"\nplaintext = true\n").unwrap();

        let cli = Cli {
            config: Some(path),
            addr: Some("127.0.0.1:8080".to_string()),
            ..Cli::default()
        };
        let config = cli.load_config().unwrap();
        assert_eq!(config.proxy.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(config.addr, "127.0.0.1:8080");
        assert!(config.plaintext);
    }

    #[test]
    fn test_load_missing_config_file() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/tsrproxy.toml")),
            ..Cli::default()
        };
        assert!(cli.load_config().is_err());
    }
}
