use crate::config::{ProxyConfig, ServeMode};
use crate::error::bad_gateway_response;
use crate::forward::Forwarder;
use crate::listener::{is_transient_accept_error, Listener};
use crate::tls::TlsTerminator;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Body type of every response the proxy writes
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// The reverse proxy server: accepts connections, optionally terminates TLS
/// and forwards every request to the backend
pub struct ProxyServer {
    forwarder: Arc<Forwarder>,
    tls_terminator: Option<TlsTerminator>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(forwarder: Forwarder, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            forwarder: Arc::new(forwarder),
            tls_terminator: None,
            shutdown_rx,
        }
    }

    /// Build a server for `config`. In TLS mode `certificates` is consulted
    /// for every handshake; in plaintext mode it is not needed.
    pub fn from_config(
        config: &ProxyConfig,
        shutdown_rx: watch::Receiver<bool>,
        certificates: Option<Arc<dyn crate::certs::CertificateSource>>,
    ) -> anyhow::Result<Self> {
        let forwarder = Forwarder::new(config.backend.clone(), config.timeout)
            .map_err(|e| anyhow::anyhow!("Failed to configure backend TLS: {}", e))?;
        let server = Self::new(forwarder, shutdown_rx);

        match (config.mode, certificates) {
            (ServeMode::Tls, Some(certificates)) => Ok(server.with_tls(TlsTerminator::new(certificates))),
            (ServeMode::Tls, None) => anyhow::bail!("TLS mode requires a certificate source"),
            (ServeMode::Plaintext, _) => Ok(server),
        }
    }

    pub fn with_tls(mut self, terminator: TlsTerminator) -> Self {
        self.tls_terminator = Some(terminator);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_terminator.is_some()
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    /// Serve connections from `listener` until shutdown is signalled or the
    /// listener fails. The listener is closed when this returns.
    pub async fn run<L: Listener>(self, mut listener: L) -> anyhow::Result<()> {
        let protocol = if self.tls_terminator.is_some() { "HTTPS" } else { "HTTP" };
        match listener.local_addr() {
            Ok(addr) => info!(addr = %addr, protocol, backend = %self.forwarder.backend(), "Proxy server listening (HTTP/1.1 and HTTP/2)"),
            Err(_) => info!(protocol, backend = %self.forwarder.backend(), "Proxy server listening (HTTP/1.1 and HTTP/2)"),
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut backoff = MIN_ACCEPT_BACKOFF;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            backoff = MIN_ACCEPT_BACKOFF;
                            let forwarder = Arc::clone(&self.forwarder);
                            let tls_terminator = self.tls_terminator.clone();

                            tokio::spawn(async move {
                                if let Some(terminator) = tls_terminator {
                                    match terminator.terminate(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, forwarder).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %crate::error::error_chain(&e), "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, forwarder).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Failed to accept connection");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                        }
                        Err(e) => {
                            let stats = self.forwarder.stats();
                            error!(
                                error = %e,
                                requests = stats.get_requests(),
                                failures = stats.get_failures(),
                                "Listener failed"
                            );
                            return Err(anyhow::anyhow!("Listener failed: {}", e));
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        let stats = self.forwarder.stats();
                        info!(
                            requests = stats.get_requests(),
                            failures = stats.get_failures(),
                            "Proxy server shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, forwarder: Arc<Forwarder>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let forwarder = Arc::clone(&forwarder);
        async move { handle_request(req, forwarder, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    forwarder: Arc<Forwarder>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(client = %client_addr, method = %method, path, "Incoming request");

    match forwarder.forward(req, Some(client_addr.ip())).await {
        Ok(response) => {
            debug!(client = %client_addr, method = %method, path, status = response.status().as_u16(), "Forwarded request");
            Ok(response)
        }
        Err(e) => {
            warn!(
                client = %client_addr,
                method = %method,
                path,
                backend = %forwarder.backend(),
                error = %crate::error::error_chain(&e),
                "Backend request failed"
            );
            Ok(bad_gateway_response(&e))
        }
    }
}
