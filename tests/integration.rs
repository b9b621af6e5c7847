//! Integration tests for tsrproxy

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tsrproxy::certs::{CertificateError, CertificateRecord, CertificateSource, SelfSignedCertificates};
use tsrproxy::config::ListenAddr;
use tsrproxy::forward::{ForwardStats, Forwarder};
use tsrproxy::listener;
use tsrproxy::proxy::ProxyServer;
use tsrproxy::tls::TlsTerminator;

type BackendBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

const LARGE_BODY_LEN: usize = 4 * 1024 * 1024;

fn full(body: impl Into<Bytes>) -> BackendBody {
    Full::new(body.into()).boxed()
}

/// Backend used by most tests. It echoes what it received in `x-echo-*`
/// response headers and has a few routes with special behavior.
async fn backend_handler(mut req: Request<Incoming>) -> Result<Response<BackendBody>, Infallible> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    let host = header("host");
    let forwarded_for = header("x-forwarded-for");
    let drop_seen = if req.headers().contains_key("x-drop") { "present" } else { "absent" };
    let wants_upgrade = req.headers().contains_key("upgrade");
    let path = req.uri().path().to_string();

    let response = match path.as_str() {
        "/teapot" => Response::builder()
            .status(StatusCode::IM_A_TEAPOT)
            .body(full("short and stout")),
        "/empty" => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Empty::<Bytes>::new().boxed()),
        "/large" => Response::builder()
            .header("content-type", "application/octet-stream")
            .body(full(vec![b'x'; LARGE_BODY_LEN])),
        "/upload" => {
            let received = req
                .into_body()
                .collect()
                .await
                .map(|body| body.to_bytes().len())
                .unwrap_or(0);
            Response::builder().body(full(received.to_string()))
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Response::builder().body(full("too late"))
        }
        "/headers" => Response::builder()
            .header("x-backend", "yes")
            .header("keep-alive", "timeout=5")
            .header("set-cookie", "session=abc")
            .body(full("headers")),
        "/ws" if wants_upgrade => {
            let upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                if let Ok(upgraded) = upgrade.await {
                    let mut io = TokioIo::new(upgraded);
                    let mut buf = [0u8; 64];
                    while let Ok(n) = io.read(&mut buf).await {
                        if n == 0 || io.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            });
            Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header("connection", "upgrade")
                .header("upgrade", "echo")
                .body(Empty::<Bytes>::new().boxed())
        }
        _ => Response::builder()
            .header("x-echo-uri", uri)
            .header("x-echo-host", host)
            .header("x-echo-forwarded-for", forwarded_for)
            .header("x-echo-drop", drop_seen)
            .body(full("hello from backend")),
    };

    Ok(response.unwrap())
}

/// Start the test backend on an ephemeral port
async fn start_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(backend_handler))
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

/// An address nothing is listening on
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn local_listener() -> TcpListener {
    let addr: ListenAddr = "127.0.0.1:0".parse().unwrap();
    listener::listen("tcp", &addr).await.unwrap()
}

struct RunningProxy {
    addr: SocketAddr,
    stats: Arc<ForwardStats>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start_server(server: ProxyServer, shutdown: watch::Sender<bool>) -> RunningProxy {
    let listener = local_listener().await;
    let addr = listener.local_addr().unwrap();
    let stats = server.forwarder().stats();
    let handle = tokio::spawn(server.run(listener));

    RunningProxy {
        addr,
        stats,
        shutdown,
        handle,
    }
}

/// Start a plaintext proxy in front of `backend`
async fn start_proxy(backend: &str, timeout: Option<Duration>) -> RunningProxy {
    let forwarder = Forwarder::new(backend.parse().unwrap(), timeout).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    start_server(ProxyServer::new(forwarder, shutdown_rx), shutdown_tx).await
}

/// Start a TLS-terminating proxy in front of `backend`
async fn start_tls_proxy(backend: &str, certificates: Arc<dyn CertificateSource>) -> RunningProxy {
    let forwarder = Forwarder::new(backend.parse().unwrap(), Some(Duration::from_secs(2))).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(forwarder, shutdown_rx).with_tls(TlsTerminator::new(certificates));
    start_server(server, shutdown_tx).await
}

struct HttpResponse {
    status: u16,
    /// Header block, lowercased
    head: String,
    body: Vec<u8>,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name);
        self.head
            .lines()
            .find(|line| line.starts_with(&prefix))
            .map(|line| line[prefix.len()..].trim().to_string())
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

fn parse_response(raw: &[u8]) -> HttpResponse {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("complete response head");
    let head = String::from_utf8_lossy(&raw[..split]).to_lowercase();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    let mut response = HttpResponse {
        status,
        head,
        body: raw[split + 4..].to_vec(),
    };

    if response.header("transfer-encoding").as_deref() == Some("chunked") {
        response.body = dechunk(&response.body);
    }
    response
}

fn dechunk(mut data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line_end = data.windows(2).position(|w| w == b"\r\n").expect("chunk size line");
        let size_text = String::from_utf8_lossy(&data[..line_end]).to_string();
        let size = usize::from_str_radix(size_text.split(';').next().unwrap().trim(), 16).unwrap();
        data = &data[line_end + 2..];
        if size == 0 {
            return body;
        }
        body.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

/// Read until the peer closes. A TLS peer that closes without close_notify
/// still yields what was received.
async fn read_all<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut raw = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
    }
    raw
}

/// Send one request on `stream` and read the whole response
async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    path: &str,
    host: &str,
    extra_headers: &[(&str, &str)],
) -> HttpResponse {
    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path, host);
    let mut connection = "close".to_string();
    for (name, value) in extra_headers {
        if name.eq_ignore_ascii_case("connection") {
            connection = format!("close, {}", value);
        } else {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    request.push_str(&format!("Connection: {}\r\n\r\n", connection));

    stream.write_all(request.as_bytes()).await.unwrap();
    parse_response(&read_all(stream).await)
}

/// Send an HTTP GET through a plaintext proxy
async fn http_get(addr: SocketAddr, path: &str) -> HttpResponse {
    http_get_with_headers(addr, path, &[]).await
}

async fn http_get_with_headers(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    exchange(&mut stream, path, "tsrproxy.tailnet.ts.net", headers).await
}

fn connector_trusting(record: &CertificateRecord) -> TlsConnector {
    connector_with_alpn(record, Vec::new())
}

fn connector_with_alpn(record: &CertificateRecord, alpn: Vec<Vec<u8>>) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(record.chain[0].clone()).unwrap();
    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = alpn;
    TlsConnector::from(Arc::new(config))
}

/// Certificate source that records every server name it is asked for
#[derive(Default)]
struct RecordingCertificates {
    inner: SelfSignedCertificates,
    requested: parking_lot::Mutex<Vec<String>>,
}

#[async_trait]
impl CertificateSource for RecordingCertificates {
    async fn get_certificate(&self, server_name: &str) -> Result<CertificateRecord, CertificateError> {
        self.requested.lock().push(server_name.to_string());
        self.inner.get_certificate(server_name).await
    }
}

struct NoCertificates;

#[async_trait]
impl CertificateSource for NoCertificates {
    async fn get_certificate(&self, server_name: &str) -> Result<CertificateRecord, CertificateError> {
        Err(CertificateError::NotFound(server_name.to_string()))
    }
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_path_and_query_preserved() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}", backend), Some(Duration::from_secs(2))).await;

    let response = http_get(proxy.addr, "/api/items/a%20b?page=2&sort=desc").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-echo-uri").as_deref(), Some("/api/items/a%20b?page=2&sort=desc"));
    assert_eq!(response.body_text(), "hello from backend");
}

#[tokio::test]
async fn test_backend_path_prefix_and_query_merged() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}/base/?token=t", backend), None).await;

    let response = http_get(proxy.addr, "/users?id=1").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-echo-uri").as_deref(), Some("/base/users?token=t&id=1"));
}

#[tokio::test]
async fn test_host_rewritten_to_backend() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}", backend), Some(Duration::from_secs(2))).await;

    let response = http_get(proxy.addr, "/").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-echo-host"), Some(backend.to_string()));
}

#[tokio::test]
async fn test_client_address_forwarded() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}", backend), Some(Duration::from_secs(2))).await;

    let response = http_get_with_headers(proxy.addr, "/", &[("X-Forwarded-For", "203.0.113.9")]).await;

    assert_eq!(
        response.header("x-echo-forwarded-for").as_deref(),
        Some("203.0.113.9, 127.0.0.1")
    );
}

#[tokio::test]
async fn test_status_and_body_passthrough() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}", backend), Some(Duration::from_secs(2))).await;

    let teapot = http_get(proxy.addr, "/teapot").await;
    assert_eq!(teapot.status, 418);
    assert_eq!(teapot.body_text(), "short and stout");

    let empty = http_get(proxy.addr, "/empty").await;
    assert_eq!(empty.status, 204);
    assert!(empty.body.is_empty());
}

#[tokio::test]
async fn test_large_body_streamed() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}", backend), Some(Duration::from_secs(2))).await;

    let response = http_get(proxy.addr, "/large").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body.len(), LARGE_BODY_LEN);
    assert!(response.body.iter().all(|b| *b == b'x'));
    assert_eq!(response.header("content-type").as_deref(), Some("application/octet-stream"));
}

#[tokio::test]
async fn test_hop_by_hop_headers_stripped() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}", backend), Some(Duration::from_secs(2))).await;

    let response = http_get_with_headers(
        proxy.addr,
        "/",
        &[("Connection", "x-drop"), ("X-Drop", "1")],
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-echo-drop").as_deref(), Some("absent"));

    let response = http_get(proxy.addr, "/headers").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-backend").as_deref(), Some("yes"));
    assert_eq!(response.header("set-cookie").as_deref(), Some("session=abc"));
    assert!(response.header("keep-alive").is_none());
}

#[tokio::test]
async fn test_upgrade_spliced_to_backend() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}", backend), Some(Duration::from_secs(2))).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: tsrproxy\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).to_lowercase();
    assert!(head.starts_with("http/1.1 101"), "unexpected response: {}", head);
    assert!(head.contains("upgrade: echo"));

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut echoed))
        .await
        .expect("echo within timeout")
        .unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_slow_upload_not_timed_out() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}", backend), Some(Duration::from_millis(500))).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"POST /upload HTTP/1.1\r\nHost: tsrproxy\r\nContent-Length: 10\r\nConnection: close\r\n\r\nhello")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    stream.write_all(b"world").await.unwrap();

    let response = parse_response(&read_all(&mut stream).await);
    assert_eq!(response.status, 200, "unexpected body: {}", response.body_text());
    assert_eq!(response.body_text(), "10");
}

#[tokio::test]
async fn test_shutdown_closes_listener() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}", backend), Some(Duration::from_secs(2))).await;
    assert_eq!(http_get(proxy.addr, "/").await.status, 200);

    proxy.shutdown.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), proxy.handle)
        .await
        .expect("server stops after shutdown")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(proxy.stats.get_requests(), 1);
    assert!(TcpStream::connect(proxy.addr).await.is_err());
}

// ============================================================================
// Backend failures
// ============================================================================

#[tokio::test]
async fn test_unreachable_backend_returns_bad_gateway() {
    let dead = closed_port().await;
    let proxy = start_proxy(&format!("http://{}", dead), Some(Duration::from_secs(2))).await;

    let response = http_get(proxy.addr, "/anything").await;

    assert_eq!(response.status, 502);
    assert_eq!(response.header("content-type").as_deref(), Some("text/html"));
    let body = response.body_text();
    assert!(body.starts_with("<h1>"), "unexpected body: {}", body);
    assert!(body.contains("Bad Gateway"));
    assert!(!body.contains("<script"));
    assert_eq!(proxy.stats.get_failures(), 1);
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let backend = start_backend().await;
    let proxy = start_proxy(&format!("http://{}", backend), Some(Duration::from_millis(200))).await;

    let start = Instant::now();
    let response = http_get(proxy.addr, "/slow").await;

    assert_eq!(response.status, 502);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(response.body_text().contains("did not respond"));
}

#[tokio::test]
async fn test_proxies_fail_independently() {
    let backend = start_backend().await;
    let dead = closed_port().await;
    let good = start_proxy(&format!("http://{}", backend), Some(Duration::from_secs(2))).await;
    let bad = start_proxy(&format!("http://{}", dead), Some(Duration::from_secs(2))).await;

    let (ok, failed) = tokio::join!(http_get(good.addr, "/"), http_get(bad.addr, "/"));

    assert_eq!(ok.status, 200);
    assert_eq!(failed.status, 502);
    assert_eq!(good.stats.get_requests(), 1);
    assert_eq!(good.stats.get_failures(), 0);
    assert_eq!(bad.stats.get_failures(), 1);
}

#[tokio::test]
async fn test_proxy_keeps_serving_after_failure() {
    let dead = closed_port().await;
    let proxy = start_proxy(&format!("http://{}", dead), Some(Duration::from_secs(2))).await;

    for _ in 0..3 {
        assert_eq!(http_get(proxy.addr, "/").await.status, 502);
    }
    assert_eq!(proxy.stats.get_requests(), 3);
}

// ============================================================================
// TLS termination
// ============================================================================

#[tokio::test]
async fn test_tls_terminated_and_forwarded() {
    let backend = start_backend().await;
    let certificates = Arc::new(RecordingCertificates::default());
    let proxy = start_tls_proxy(&format!("http://{}", backend), certificates.clone()).await;

    let server_name = "tsrproxy.tailnet.ts.net";
    let record = certificates.inner.get_certificate(server_name).await.unwrap();
    let connector = connector_trusting(&record);

    let tcp = TcpStream::connect(proxy.addr).await.unwrap();
    let mut tls = connector
        .connect(ServerName::try_from(server_name).unwrap(), tcp)
        .await
        .unwrap();
    let response = exchange(&mut tls, "/secure?x=1", server_name, &[]).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-echo-uri").as_deref(), Some("/secure?x=1"));
    assert_eq!(response.header("x-echo-host"), Some(backend.to_string()));
    assert_eq!(*certificates.requested.lock(), vec![server_name.to_string()]);
}

#[tokio::test]
async fn test_http2_negotiated_over_tls() {
    let backend = start_backend().await;
    let certificates = Arc::new(SelfSignedCertificates::new());
    let proxy = start_tls_proxy(&format!("http://{}", backend), certificates.clone()).await;

    let server_name = "tsrproxy.tailnet.ts.net";
    let record = certificates.get_certificate(server_name).await.unwrap();
    let connector = connector_with_alpn(&record, vec![b"h2".to_vec()]);

    let tcp = TcpStream::connect(proxy.addr).await.unwrap();
    let tls = connector
        .connect(ServerName::try_from(server_name).unwrap(), tcp)
        .await
        .unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

    let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .uri(format!("https://{}/h2?x=1", server_name))
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), hyper::Version::HTTP_2);
    assert_eq!(response.headers()["x-echo-uri"], "/h2?x=1");
    assert_eq!(response.headers()["x-echo-host"], backend.to_string().as_str());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello from backend");
}

#[tokio::test]
async fn test_tls_listener_has_no_plaintext_fallback() {
    let backend = start_backend().await;
    let proxy = start_tls_proxy(&format!("http://{}", backend), Arc::new(SelfSignedCertificates::new())).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: tsrproxy\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let raw = tokio::time::timeout(Duration::from_secs(2), read_all(&mut stream))
        .await
        .expect("connection closed");

    assert!(!raw.starts_with(b"HTTP/"));
    assert!(!String::from_utf8_lossy(&raw).contains("hello from backend"));
    assert_eq!(proxy.stats.get_requests(), 0);
}

#[tokio::test]
async fn test_certificate_lookup_failure_fails_handshake() {
    let backend = start_backend().await;
    let proxy = start_tls_proxy(&format!("http://{}", backend), Arc::new(NoCertificates)).await;

    let record = tsrproxy::certs::generate_self_signed("missing.tailnet.ts.net").unwrap();
    let connector = connector_trusting(&record);
    let tcp = TcpStream::connect(proxy.addr).await.unwrap();
    let result = connector
        .connect(ServerName::try_from("missing.tailnet.ts.net").unwrap(), tcp)
        .await;
    assert!(result.is_err());

    // The listener survives a failed handshake
    let tcp = TcpStream::connect(proxy.addr).await;
    assert!(tcp.is_ok());
    assert_eq!(proxy.stats.get_requests(), 0);
}

// ============================================================================
// Binary
// ============================================================================

#[test]
fn test_missing_backend_exits_with_usage() {
    let mut command = std::process::Command::new(env!("CARGO_BIN_EXE_tsrproxy"));
    for (key, _) in std::env::vars() {
        if key.starts_with("TSRPROXY_") {
            command.env_remove(key);
        }
    }
    let output = command.env_remove("RUST_LOG").output().unwrap();

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stdout).contains("--proxy"));
}

#[test]
fn test_invalid_backend_exits_nonzero() {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_tsrproxy"))
        .args(["--proxy", "ftp://files.example", "--addr", "127.0.0.1:0", "--plaintext"])
        .env_remove("TSRPROXY_CONFIG")
        .output()
        .unwrap();

    assert!(!output.status.success());
}
