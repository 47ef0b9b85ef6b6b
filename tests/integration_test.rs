//! Integration tests for AuthProxy
//!
//! Drives real listeners on loopback:
//! - Authentication and quota rejections
//! - Plain HTTP forwarding and header sanitization
//! - CONNECT tunnels, teardown and session accounting
//! - The TLS-terminated endpoint

use authproxy::auth::{hash_password, UserStatus};
use authproxy::database::Database;
use authproxy::proxy::BoundAddrs;
use authproxy::tunnel::ESTABLISHED;
use authproxy::{ProxyConfig, ProxyOrchestrator};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, ServerName};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_rustls::TlsConnector;

const PASSWORD: &str = "s3cret";

struct Harness {
    _dir: TempDir,
    db: Database,
    proxy: ProxyOrchestrator,
    addrs: BoundAddrs,
}

async fn start_proxy(users: &[(&str, u32)], configure: impl FnOnce(&mut ProxyConfig, &TempDir)) -> Harness {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("proxy.db");
    let db = Database::open(&db_path).unwrap();

    let hash = hash_password(PASSWORD).unwrap();
    for (username, max_connections) in users {
        db.insert_user(username, &hash, UserStatus::Active, *max_connections)
            .unwrap();
    }

    let mut config = ProxyConfig {
        host: "127.0.0.1".to_string(),
        http_port: 0,
        https_port: 0,
        db_path,
        shutdown_grace: Duration::from_millis(500),
        ..ProxyConfig::default()
    };
    configure(&mut config, &dir);

    let proxy = ProxyOrchestrator::new(config);
    let addrs = proxy.start().await.unwrap();

    Harness {
        _dir: dir,
        db,
        proxy,
        addrs,
    }
}

fn basic(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

/// Origin that describes the request it received
async fn run_backend_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("none")
                            .to_string()
                    };
                    let summary = format!(
                        "method={}|uri={}|ua={}|xff={}|auth={}|via={}",
                        req.method(),
                        req.uri(),
                        header("user-agent"),
                        header("x-forwarded-for"),
                        header("proxy-authorization"),
                        header("via"),
                    );
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    let text = format!("{}|len={}", summary, body.len());

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(200)
                            .header("Server", "origin/1.0")
                            .header("X-Powered-By", "PHP/8.2")
                            .header("Cache-Control", "max-age=3600")
                            .body(Full::new(Bytes::from(text)))
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    (addr, accepted)
}

/// Echo server that reports each connection's EOF
async fn run_echo_server() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let closed = closed_tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = closed.send(());
            });
        }
    });

    (addr, closed_rx)
}

/// Origin that reads one request head, writes `reply`, then holds the
/// connection and reports when the proxy closes it
async fn run_stalling_origin(reply: &'static [u8]) -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let closed = closed_tx.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(reply).await;
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                let _ = closed.send(());
            });
        }
    });

    (addr, closed_rx)
}

/// A port nothing listens on
fn refused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Read one response; the body is read to `Content-Length` or EOF
async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, String) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed mid-head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();

    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        });

    let body = match length {
        Some(length) => {
            let mut body = vec![0u8; length];
            stream.read_exact(&mut body).await.unwrap();
            body
        }
        None => {
            let mut body = Vec::new();
            let _ = stream.read_to_end(&mut body).await;
            body
        }
    };

    (head, String::from_utf8_lossy(&body).to_string())
}

async fn send_raw<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, request: &str) -> (String, String) {
    stream.write_all(request.as_bytes()).await.unwrap();
    read_response(stream).await
}

async fn open_tunnel(proxy: SocketAddr, target: SocketAddr, authorization: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: {authorization}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut reply = vec![0u8; ESTABLISHED.len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, ESTABLISHED);
    stream
}

async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_missing_credentials_never_reach_origin() {
    let harness = start_proxy(&[("alice", 5)], |_, _| {}).await;
    let (origin, accepted) = run_backend_server().await;

    let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
    let (head, body) = send_raw(
        &mut stream,
        &format!("GET http://{origin}/secret HTTP/1.1\r\nHost: {origin}\r\n\r\n"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 407"), "{}", head);
    assert!(head
        .to_lowercase()
        .contains("proxy-authenticate: basic realm=\"proxy server\""));
    assert_eq!(body, "Proxy authentication required");

    let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
    let (head, _) = send_raw(
        &mut stream,
        &format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 407"), "{}", head);

    assert_eq!(accepted.load(Ordering::SeqCst), 0);
    assert_eq!(harness.proxy.tracker().stats().total_sessions, 0);
    harness.proxy.stop().await;
}

#[tokio::test]
async fn test_bad_password_and_unknown_user_are_indistinguishable() {
    let harness = start_proxy(&[("alice", 5)], |_, _| {}).await;
    let (origin, _) = run_backend_server().await;

    let mut replies = Vec::new();
    for authorization in [basic("alice", "wrong"), basic("mallory", PASSWORD)] {
        let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
        let reply = send_raw(
            &mut stream,
            &format!(
                "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nProxy-Authorization: {authorization}\r\n\r\n"
            ),
        )
        .await;
        replies.push(reply);
    }

    assert!(replies[0].0.starts_with("HTTP/1.1 407"));
    assert_eq!(replies[0].1, replies[1].1);
    harness.proxy.stop().await;
}

#[tokio::test]
async fn test_forwarding_sanitizes_both_directions() {
    let harness = start_proxy(&[("alice", 5)], |_, _| {}).await;
    let (origin, accepted) = run_backend_server().await;

    let proxy_url = format!("http://alice:{}@{}", PASSWORD, harness.addrs.http);
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(proxy_url).unwrap())
        .build()
        .unwrap();

    let response = client
        .post(format!("http://{origin}/submit?x=1"))
        .header("X-Forwarded-For", "10.1.2.3")
        .header("Via", "1.1 somewhere")
        .body("hello world")
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    let headers = response.headers().clone();
    assert!(headers.get("server").is_none());
    assert!(headers.get("x-powered-by").is_none());
    assert_eq!(headers["cache-control"], "no-cache, no-store, must-revalidate");
    assert_eq!(headers["pragma"], "no-cache");
    assert!(headers.get("strict-transport-security").is_none());

    let body = response.text().await.unwrap();
    assert!(body.contains("method=POST"), "{}", body);
    assert!(body.contains("uri=/submit?x=1"), "{}", body);
    assert!(body.contains("xff=none"), "{}", body);
    assert!(body.contains("auth=none"), "{}", body);
    assert!(body.contains("via=none"), "{}", body);
    assert!(body.contains("Chrome/120"), "{}", body);
    assert!(body.ends_with("len=11"), "{}", body);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    assert!(
        wait_until(Duration::from_secs(2), || harness.proxy.tracker().stats().total_sessions == 0).await
    );
    harness.proxy.stop().await;

    let sessions = harness.db.user_sessions("alice").unwrap();
    assert_eq!(sessions.len(), 1);
    let actions = harness.db.session_actions(&sessions[0]).unwrap();
    assert_eq!(actions, vec!["connect", "http_request", "disconnect"]);
}

#[tokio::test]
async fn test_user_at_quota_is_refused() {
    let harness = start_proxy(&[("bob", 1)], |_, _| {}).await;
    let (echo, _closed) = run_echo_server().await;
    let (origin, accepted) = run_backend_server().await;
    let authorization = basic("bob", PASSWORD);

    let tunnel = open_tunnel(harness.addrs.http, echo, &authorization).await;
    let tracker = harness.proxy.tracker().clone();
    assert_eq!(tracker.user_count("bob"), 1);

    let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
    let (head, body) = send_raw(
        &mut stream,
        &format!(
            "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nProxy-Authorization: {authorization}\r\n\r\n"
        ),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 429"), "{}", head);
    assert!(body.contains("user bob"), "{}", body);
    assert_eq!(tracker.user_count("bob"), 1);
    assert_eq!(accepted.load(Ordering::SeqCst), 0);

    // A CONNECT over quota is answered with a fresh challenge
    let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
    let (head, body) = send_raw(
        &mut stream,
        &format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\nProxy-Authorization: {authorization}\r\n\r\n"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 407"), "{}", head);
    assert!(head.contains("Proxy-Authenticate: Basic realm=\"Proxy Server\""), "{}", head);
    assert!(body.contains("Too many connections for user bob"), "{}", body);
    assert_eq!(tracker.user_count("bob"), 1);

    drop(tunnel);
    assert!(wait_until(Duration::from_secs(2), || tracker.user_count("bob") == 0).await);
    harness.proxy.stop().await;
}

#[tokio::test]
async fn test_connect_relays_bytes_verbatim() {
    let harness = start_proxy(&[("alice", 5)], |_, _| {}).await;
    let (echo, _closed) = run_echo_server().await;

    let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
    // Bytes sent right behind the CONNECT head must reach the origin too
    let request = format!(
        "CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\nProxy-Authorization: {}\r\n\r\nearly",
        basic("alice", PASSWORD)
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut reply = vec![0u8; ESTABLISHED.len() + 5];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..ESTABLISHED.len()], ESTABLISHED);
    assert_eq!(&reply[ESTABLISHED.len()..], b"early");

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let (mut read_half, mut write_half) = stream.into_split();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        write_half.write_all(&payload).await.unwrap();
        write_half
    });

    let mut echoed = vec![0u8; expected.len()];
    read_half.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, expected);
    let _ = writer.await.unwrap();

    harness.proxy.stop().await;
}

#[tokio::test]
async fn test_client_close_releases_session_once() {
    let harness = start_proxy(&[("alice", 5)], |_, _| {}).await;
    let (echo, mut closed) = run_echo_server().await;

    let mut tunnel = open_tunnel(harness.addrs.http, echo, &basic("alice", PASSWORD)).await;
    tunnel.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tunnel.read_exact(&mut buf).await.unwrap();

    let tracker = harness.proxy.tracker().clone();
    assert_eq!(tracker.stats().total_sessions, 1);

    drop(tunnel);
    timeout(Duration::from_secs(5), closed.recv())
        .await
        .expect("upstream socket was not closed")
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || tracker.stats().total_sessions == 0).await);
    assert_eq!(tracker.ip_count("127.0.0.1"), 0);

    harness.proxy.stop().await;

    let sessions = harness.db.user_sessions("alice").unwrap();
    assert_eq!(sessions.len(), 1);
    let actions = harness.db.session_actions(&sessions[0]).unwrap();
    assert_eq!(actions, vec!["connect", "https_tunnel", "disconnect"]);
}

#[tokio::test]
async fn test_unreachable_origin_gives_502() {
    let harness = start_proxy(&[("alice", 5)], |_, _| {}).await;
    let dead = refused_addr();
    let authorization = basic("alice", PASSWORD);
    let tracker = harness.proxy.tracker().clone();

    let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
    let (head, body) = send_raw(
        &mut stream,
        &format!(
            "GET http://{dead}/ HTTP/1.1\r\nHost: {dead}\r\nProxy-Authorization: {authorization}\r\n\r\n"
        ),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 502"), "{}", head);
    assert!(body.contains("unable to reach 127.0.0.1"), "{}", body);
    assert_eq!(tracker.stats().total_sessions, 0);

    let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
    let (head, body) = send_raw(
        &mut stream,
        &format!("CONNECT {dead} HTTP/1.1\r\nHost: {dead}\r\nProxy-Authorization: {authorization}\r\n\r\n"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 502"), "{}", head);
    assert!(body.contains("unable to reach 127.0.0.1"), "{}", body);
    assert_eq!(tracker.stats().total_sessions, 0);
    assert_eq!(tracker.user_count("alice"), 0);

    harness.proxy.stop().await;
}

#[tokio::test]
async fn test_client_abort_before_response_head_closes_upstream() {
    let harness = start_proxy(&[("alice", 5)], |_, _| {}).await;
    let (origin, mut closed) = run_stalling_origin(b"").await;
    let authorization = basic("alice", PASSWORD);
    let tracker = harness.proxy.tracker().clone();

    let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
    stream
        .write_all(
            format!(
                "GET http://{origin}/slow HTTP/1.1\r\nHost: {origin}\r\nProxy-Authorization: {authorization}\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || tracker.stats().total_sessions == 1).await);

    drop(stream);
    timeout(Duration::from_secs(5), closed.recv())
        .await
        .expect("upstream socket was not closed")
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || tracker.stats().total_sessions == 0).await);

    harness.proxy.stop().await;

    let sessions = harness.db.user_sessions("alice").unwrap();
    assert_eq!(sessions.len(), 1);
    let actions = harness.db.session_actions(&sessions[0]).unwrap();
    assert_eq!(actions, vec!["connect", "http_request", "disconnect"]);
}

#[tokio::test]
async fn test_client_abort_mid_body_closes_upstream() {
    let harness = start_proxy(&[("alice", 5)], |_, _| {}).await;
    let (origin, mut closed) =
        run_stalling_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\npartial").await;
    let authorization = basic("alice", PASSWORD);
    let tracker = harness.proxy.tracker().clone();

    let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
    stream
        .write_all(
            format!(
                "GET http://{origin}/big HTTP/1.1\r\nHost: {origin}\r\nProxy-Authorization: {authorization}\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    // Wait for the first body bytes to come through
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while !received.ends_with(b"partial") {
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "proxy closed early: {:?}", String::from_utf8_lossy(&received));
        received.extend_from_slice(&buf[..n]);
    }
    assert!(received.starts_with(b"HTTP/1.1 200"));
    assert_eq!(tracker.stats().total_sessions, 1);

    drop(stream);
    timeout(Duration::from_secs(5), closed.recv())
        .await
        .expect("upstream socket was not closed")
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || tracker.stats().total_sessions == 0).await);

    harness.proxy.stop().await;

    let sessions = harness.db.user_sessions("alice").unwrap();
    assert_eq!(sessions.len(), 1);
    let actions = harness.db.session_actions(&sessions[0]).unwrap();
    assert_eq!(actions, vec!["connect", "http_request", "disconnect"]);
}

#[tokio::test]
async fn test_upstream_timeout_gives_502() {
    let harness = start_proxy(&[("alice", 5)], |config, _| {
        config.timeouts.upstream = Duration::from_millis(500);
    })
    .await;
    let (origin, mut closed) = run_stalling_origin(b"").await;
    let authorization = basic("alice", PASSWORD);
    let tracker = harness.proxy.tracker().clone();

    let started = Instant::now();
    let mut stream = TcpStream::connect(harness.addrs.http).await.unwrap();
    let (head, body) = send_raw(
        &mut stream,
        &format!(
            "GET http://{origin}/hang HTTP/1.1\r\nHost: {origin}\r\nProxy-Authorization: {authorization}\r\n\r\n"
        ),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 502"), "{}", head);
    assert!(body.contains("unable to reach 127.0.0.1"), "{}", body);
    assert!(started.elapsed() < Duration::from_secs(5));

    timeout(Duration::from_secs(2), closed.recv())
        .await
        .expect("upstream socket was not closed")
        .unwrap();
    assert_eq!(tracker.stats().total_sessions, 0);
    assert_eq!(tracker.user_count("alice"), 0);

    harness.proxy.stop().await;

    let sessions = harness.db.user_sessions("alice").unwrap();
    let actions = harness.db.session_actions(&sessions[0]).unwrap();
    assert_eq!(actions, vec!["connect", "http_request", "error"]);
}

#[tokio::test]
async fn test_stop_cuts_off_idle_tunnels() {
    let harness = start_proxy(&[("alice", 5)], |_, _| {}).await;
    let (echo, mut closed) = run_echo_server().await;

    let mut tunnel = open_tunnel(harness.addrs.http, echo, &basic("alice", PASSWORD)).await;

    let started = Instant::now();
    harness.proxy.stop().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    timeout(Duration::from_secs(2), closed.recv()).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), tunnel.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(TcpStream::connect(harness.addrs.http).await.is_err());
}

#[tokio::test]
async fn test_tls_endpoint() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let cert_pem = cert.serialize_pem().unwrap();
    let key_pem = cert.serialize_private_key_pem();

    let harness = start_proxy(&[("alice", 5)], |config, dir| {
        let cert_path = dir.path().join("proxy.crt");
        let key_path = dir.path().join("proxy.key");
        std::fs::write(&cert_path, &cert_pem).unwrap();
        std::fs::write(&key_path, &key_pem).unwrap();
        config.ssl_enabled = true;
        config.cert_path = Some(cert_path);
        config.key_path = Some(key_path);
    })
    .await;
    let https = harness.addrs.https.expect("HTTPS endpoint should be up");
    let (echo, _closed) = run_echo_server().await;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from("localhost").unwrap();

    // Realm differs on the TLS endpoint
    let stream = TcpStream::connect(https).await.unwrap();
    let mut tls = connector.connect(server_name.clone(), stream).await.unwrap();
    let (head, _) = send_raw(
        &mut tls,
        &format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 407"), "{}", head);
    assert!(head.contains("Basic realm=\"HTTPS Proxy Server\""), "{}", head);

    let stream = TcpStream::connect(https).await.unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();
    let request = format!(
        "CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\nProxy-Authorization: {}\r\n\r\n",
        basic("alice", PASSWORD)
    );
    tls.write_all(request.as_bytes()).await.unwrap();
    let mut reply = vec![0u8; ESTABLISHED.len()];
    tls.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, ESTABLISHED);

    tls.write_all(b"over tls").await.unwrap();
    let mut buf = [0u8; 8];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"over tls");

    drop(tls);
    harness.proxy.stop().await;
}
