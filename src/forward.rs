//! Forwarding of requests to the single backend origin
//!
//! Requests are rewritten onto the backend origin, sent through a pooled
//! hyper client and the response is streamed back without buffering.

use crate::config::BackendOrigin;
use crate::proxy::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, TE, UPGRADE};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that only apply to a single transport leg
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Errors from forwarding a request to the backend
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    #[error("backend request failed")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("invalid backend request")]
    Request(#[from] hyper::http::Error),
}

/// Counters for forwarded requests
#[derive(Debug, Default)]
pub struct ForwardStats {
    pub requests: AtomicU64,
    pub failures: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Forwards requests to one backend origin
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, UploadBody<Incoming>>,
    backend: BackendOrigin,
    timeout: Option<Duration>,
    stats: Arc<ForwardStats>,
}

impl Forwarder {
    /// Create a forwarder for `backend`. `timeout` bounds connecting and
    /// waiting for the response headers; `None` leaves both unbounded.
    pub fn new(backend: BackendOrigin, timeout: Option<Duration>) -> Result<Self, rustls::Error> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(timeout);

        let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        debug!(
            backend = %backend,
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "Forwarder initialized"
        );

        Ok(Self {
            client,
            backend,
            timeout,
            stats: Arc::new(ForwardStats::default()),
        })
    }

    pub fn backend(&self) -> &BackendOrigin {
        &self.backend
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Send `req` to the backend and return its response with the body still
    /// streaming. Upgrade requests answered with 101 are spliced to the
    /// backend connection in a background task.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        client_ip: Option<IpAddr>,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        self.stats.record_request();

        let upgrade = upgrade_protocol(req.headers());
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let (uploaded_tx, uploaded_rx) = oneshot::channel();
        let outbound = self
            .outbound_request(req, client_ip)?
            .map(|body| UploadBody::new(body, uploaded_tx));

        let result = match self.timeout {
            Some(limit) => {
                let response = self.client.request(outbound);
                tokio::pin!(response);

                // The response deadline starts once the request body is sent
                let deadline = async {
                    let _ = uploaded_rx.await;
                    tokio::time::sleep(limit).await;
                };

                tokio::select! {
                    result = &mut response => result.map_err(ForwardError::from),
                    _ = deadline => Err(ForwardError::Timeout(limit)),
                }
            }
            None => self.client.request(outbound).await.map_err(ForwardError::from),
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e);
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                let protocol = upgrade.unwrap_or_default();
                tokio::spawn(splice_upgraded(client_upgrade, backend_upgrade, protocol));
                let (parts, body) = response.into_parts();
                return Ok(Response::from_parts(parts, body.boxed()));
            }
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Rewrite an inbound request onto the backend origin
    pub fn outbound_request<B>(
        &self,
        req: Request<B>,
        client_ip: Option<IpAddr>,
    ) -> Result<Request<B>, ForwardError> {
        let (parts, body) = req.into_parts();
        let target: Uri = self
            .backend
            .target(parts.uri.path(), parts.uri.query())
            .parse()
            .map_err(hyper::http::Error::from)?;

        let upgrade = upgrade_protocol(&parts.headers);
        let wants_trailers = te_allows_trailers(&parts.headers);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        if wants_trailers {
            headers.insert(TE, HeaderValue::from_static("trailers"));
        }
        if let Some(protocol) = upgrade {
            headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(UPGRADE, HeaderValue::from_str(&protocol).map_err(hyper::http::Error::from)?);
        }
        if let Some(ip) = client_ip {
            append_forwarded_for(&mut headers, ip);
        }
        headers.insert(
            HOST,
            HeaderValue::from_str(self.backend.authority()).map_err(hyper::http::Error::from)?,
        );

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(target)
            .version(Version::HTTP_11);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        Ok(builder.body(body)?)
    }
}

/// Request body sent to the backend. Signals once the inbound body has been
/// read to the end, or is dropped unfinished.
pub struct UploadBody<B> {
    inner: B,
    uploaded: Option<oneshot::Sender<()>>,
}

impl<B: Body> UploadBody<B> {
    pub fn new(inner: B, uploaded: oneshot::Sender<()>) -> Self {
        let mut body = Self {
            inner,
            uploaded: Some(uploaded),
        };
        if body.inner.is_end_stream() {
            body.signal();
        }
        body
    }

    fn signal(&mut self) {
        if let Some(tx) = self.uploaded.take() {
            let _ = tx.send(());
        }
    }
}

impl<B: Body + Unpin> Body for UploadBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        match &poll {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => this.signal(),
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.signal(),
            _ => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// The protocol an upgrade request asks for, if it is one
fn upgrade_protocol(headers: &HeaderMap) -> Option<String> {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if !connection_upgrade {
        return None;
    }
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn te_allows_trailers(headers: &HeaderMap) -> bool {
    headers
        .get_all(TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("trailers"))
}

/// Append `ip` to any `X-Forwarded-For` chain from earlier proxies
fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Copy bytes both ways between an upgraded client and backend connection
async fn splice_upgraded(
    client: hyper::upgrade::OnUpgrade,
    backend: hyper::upgrade::OnUpgrade,
    protocol: String,
) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(protocol, error = %e, "Upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(protocol, client_to_backend, backend_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(protocol, error = %e, "Upgraded connection closed with error");
        }
    }
}
