use clap::{CommandFactory, Parser};
use std::path::Path;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tsrproxy::certs;
use tsrproxy::cli::Cli;
use tsrproxy::config::{ConfigError, ProxyConfig, ServeMode};
use tsrproxy::listener;
use tsrproxy::proxy::ProxyServer;

/// Exit status for a missing or invalid command line
const USAGE_EXIT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            init_logging(cli.verbose);
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    init_logging(config.verbose);

    let proxy_config = match ProxyConfig::from_config(&config) {
        Ok(proxy_config) => proxy_config,
        Err(ConfigError::MissingBackend) => {
            let _ = Cli::command().print_help();
            error!("--proxy required");
            return ExitCode::from(USAGE_EXIT);
        }
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(USAGE_EXIT);
        }
    };

    match run(proxy_config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{:#}", e), "Fatal error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let directive = if verbose {
        "tsrproxy=debug,hyper_util=debug,rustls=debug"
    } else {
        "tsrproxy=info"
    };

    let mut filter = EnvFilter::from_default_env();
    for part in directive.split(',') {
        filter = filter.add_directive(part.parse().expect("valid log directive"));
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    create_state_dir(&config.state_dir)?;
    info!(
        hostname = %config.hostname,
        state_dir = %config.state_dir.display(),
        "Starting {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    // The listener is owned by the server future from here on and is closed
    // on every exit path, including a failure to build the certificate source.
    let listener = listener::listen("tcp", &config.listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen on {}: {}", config.listen_addr, e))?;

    let certificates = match config.mode {
        ServeMode::Tls => Some(certs::from_config(&config)?),
        ServeMode::Plaintext => {
            info!(addr = %config.listen_addr, "Listen port is not 443, serving plaintext HTTP");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::from_config(&config, shutdown_rx, certificates)?;

    info!(
        hostname = %config.hostname,
        addr = %config.listen_addr,
        backend = %config.backend,
        tls = server.tls_enabled(),
        timeout_ms = config.timeout.map(|t| t.as_millis() as u64),
        "Proxying"
    );

    let mut server_handle = tokio::spawn(server.run(listener));

    tokio::select! {
        result = &mut server_handle => {
            return result.map_err(|e| anyhow::anyhow!("Proxy server task failed: {}", e))?;
        }
        signal = shutdown_signal() => {
            signal?;
        }
    }

    let _ = shutdown_tx.send(true);
    server_handle
        .await
        .map_err(|e| anyhow::anyhow!("Proxy server task failed: {}", e))??;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn create_state_dir(path: &Path) -> anyhow::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .map_err(|e| anyhow::anyhow!("Failed to create state directory {}: {}", path.display(), e))
}
