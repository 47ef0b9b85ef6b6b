//! Proxy endpoints
//!
//! One listener per protocol. Plain and TLS-terminated endpoints share all
//! request handling; [`EndpointKind`] only picks the auth realm, the logged
//! request action and the extra response headers.

use crate::audit::{Action, AuditLogger, Level, LogEvent};
use crate::auth::{parse_basic, AuthError, AuthValidator, Principal};
use crate::forward::{self, Target};
use crate::io::{read_request_head, Rewind, MAX_HEAD_SIZE};
use crate::tracker::{ConnectionTracker, LimitExceeded, SessionGuard};
use crate::tunnel;
use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Which listener a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Plain,
    TlsTerminated,
}

impl EndpointKind {
    pub fn is_tls(&self) -> bool {
        matches!(self, EndpointKind::TlsTerminated)
    }

    pub fn label(&self) -> &'static str {
        match self {
            EndpointKind::Plain => "HTTP",
            EndpointKind::TlsTerminated => "HTTPS",
        }
    }

    /// `Proxy-Authenticate` challenge value
    pub fn challenge(&self) -> &'static str {
        match self {
            EndpointKind::Plain => "Basic realm=\"Proxy Server\"",
            EndpointKind::TlsTerminated => "Basic realm=\"HTTPS Proxy Server\"",
        }
    }

    /// Action logged for a forwarded request
    pub fn request_action(&self) -> Action {
        match self {
            EndpointKind::Plain => Action::HttpRequest,
            EndpointKind::TlsTerminated => Action::HttpsRequest,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Upstream connect through response head, and each gap in the response body
    pub upstream: Duration,
    /// No bytes in either direction of a tunnel
    pub tunnel_idle: Duration,
    pub request_head: Duration,
    pub tls_handshake: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            upstream: Duration::from_secs(30),
            tunnel_idle: Duration::from_secs(60),
            request_head: Duration::from_secs(30),
            tls_handshake: Duration::from_secs(10),
        }
    }
}

/// Shutdown phases shared by every connection of one orchestrator
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    /// Finish in-flight work, accept no new requests
    pub drain: CancellationToken,
    /// Cut everything off now
    pub terminate: CancellationToken,
}

/// Everything a connection handler needs
pub struct HandlerContext {
    pub auth: AuthValidator,
    pub tracker: Arc<ConnectionTracker>,
    pub audit: AuditLogger,
    pub connector: TlsConnector,
    /// 0 disables the per-IP limit
    pub max_connections_per_ip: u32,
    pub timeouts: Timeouts,
    pub shutdown: Shutdown,
    pub tasks: TaskTracker,
}

/// An authenticated, quota-cleared caller
pub struct Admission {
    pub principal: Principal,
    pub session: SessionGuard,
}

/// Why a request was turned away before reaching an origin
#[derive(Debug)]
pub enum Denial {
    Unauthenticated(AuthError),
    QuotaExceeded(LimitExceeded),
}

impl Denial {
    pub fn status(&self) -> StatusCode {
        match self {
            Denial::Unauthenticated(_) => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            Denial::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn body(&self) -> String {
        match self {
            Denial::Unauthenticated(_) => "Proxy authentication required".to_string(),
            Denial::QuotaExceeded(limit) => format!("Connection refused: {}", limit),
        }
    }

    pub fn response(&self, kind: EndpointKind) -> Response<ProxyBody> {
        let mut response = text_response(self.status(), &self.body());
        if let Denial::Unauthenticated(_) = self {
            response
                .headers_mut()
                .insert(PROXY_AUTHENTICATE, HeaderValue::from_static(kind.challenge()));
        }
        response
    }

    /// Tunnel answer: always a 407 challenge, the reason stays in the body
    pub fn tunnel_response(&self, kind: EndpointKind) -> Response<ProxyBody> {
        let mut response = text_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, &self.body());
        response
            .headers_mut()
            .insert(PROXY_AUTHENTICATE, HeaderValue::from_static(kind.challenge()));
        response
    }

    /// [`Denial::tunnel_response`] as raw bytes, for sockets hyper does not own
    pub fn raw_response(&self, kind: EndpointKind) -> String {
        raw_response(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            &[("Proxy-Authenticate", kind.challenge())],
            &self.body(),
        )
    }
}

/// Username from a `Basic` header, for logging only
pub fn attempted_username(authorization: Option<&str>) -> Option<String> {
    parse_basic(authorization).ok().map(|c| c.username)
}

impl HandlerContext {
    /// Authenticate, then claim a session slot
    pub async fn admit(
        &self,
        client_ip: &str,
        authorization: Option<&str>,
        target_host: &str,
    ) -> Result<Admission, Denial> {
        let principal = match self.auth.authenticate(authorization).await {
            Ok(principal) => principal,
            Err(e) => {
                let attempted =
                    attempted_username(authorization).unwrap_or_else(|| "unknown".to_string());
                self.audit.log(
                    Level::Info,
                    &format!("{} - authentication failed: {}", attempted, e),
                );
                self.audit.record(
                    LogEvent::new(Level::Warn, Action::AuthFailed, e.to_string())
                        .user(attempted)
                        .client(client_ip)
                        .target("auth"),
                );
                return Err(Denial::Unauthenticated(e));
            }
        };

        self.audit.record(
            LogEvent::new(Level::Info, Action::AuthSuccess, "authenticated")
                .user(principal.username.as_str())
                .client(client_ip)
                .target("auth"),
        );

        let session = self
            .tracker
            .try_admit(
                client_ip,
                &principal.username,
                principal.max_connections,
                self.max_connections_per_ip,
            )
            .map_err(|limit| {
                self.audit
                    .log(Level::Warn, &format!("Connection refused: {}", limit));
                Denial::QuotaExceeded(limit)
            })?;

        self.audit.record(
            LogEvent::new(Level::Info, Action::Connect, "session admitted")
                .session(session.id())
                .user(principal.username.as_str())
                .client(client_ip)
                .target(target_host),
        );

        Ok(Admission { principal, session })
    }

    /// `METHOD target - user@ip`
    pub fn access_line(&self, method: &str, target: &str, authorization: Option<&str>, client_ip: &str) {
        let user = attempted_username(authorization).unwrap_or_else(|| "-".to_string());
        self.audit.log(
            Level::Info,
            &format!("{} {} - {}@{}", method, target, user, client_ip),
        );
    }
}

/// One listening socket and the handlers behind it
pub struct ProxyEndpoint {
    listener: TcpListener,
    kind: EndpointKind,
    acceptor: Option<TlsAcceptor>,
    ctx: Arc<HandlerContext>,
}

impl ProxyEndpoint {
    /// Bind `addr`; a TLS acceptor makes this the TLS-terminated endpoint
    pub async fn bind(
        addr: SocketAddr,
        acceptor: Option<TlsAcceptor>,
        ctx: Arc<HandlerContext>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let kind = if acceptor.is_some() {
            EndpointKind::TlsTerminated
        } else {
            EndpointKind::Plain
        };

        Ok(Self {
            listener,
            kind,
            acceptor,
            ctx,
        })
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `stop` fires; the listener closes when this returns
    pub async fn run(self, stop: CancellationToken) {
        let label = self.kind.label();
        if let Ok(addr) = self.listener.local_addr() {
            info!("{} proxy listening on {}", label, addr);
        }

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = self.ctx.clone();
                        let acceptor = self.acceptor.clone();
                        let kind = self.kind;
                        self.ctx.tasks.spawn(async move {
                            handle_connection(ctx, kind, acceptor, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("{} accept failed: {}", label, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("{} proxy stopped accepting connections", label);
    }
}

async fn handle_connection(
    ctx: Arc<HandlerContext>,
    kind: EndpointKind,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let _ = stream.set_nodelay(true);

    match acceptor {
        Some(acceptor) => {
            match timeout(ctx.timeouts.tls_handshake, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => serve(ctx, kind, tls, peer).await,
                Ok(Err(e)) => debug!("TLS handshake with {} failed: {}", peer, e),
                Err(_) => debug!("TLS handshake with {} timed out", peer),
            }
        }
        None => serve(ctx, kind, stream, peer).await,
    }
}

/// Sniff the first request head, then hand the connection to the tunnel or to hyper
async fn serve<S>(ctx: Arc<HandlerContext>, kind: EndpointKind, mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);

    let head = tokio::select! {
        _ = ctx.shutdown.drain.cancelled() => return,
        read = timeout(
            ctx.timeouts.request_head,
            read_request_head(&mut stream, &mut buf, MAX_HEAD_SIZE),
        ) => read,
    };

    let head = match head {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!("Rejecting request from {}: {}", peer, e);
            let reply = raw_response(StatusCode::BAD_REQUEST, &[], "Bad Request");
            let _ = stream.write_all(reply.as_bytes()).await;
            let _ = stream.shutdown().await;
            return;
        }
        Err(_) => {
            debug!("No request head from {} in time", peer);
            return;
        }
    };

    if head.is_connect() {
        // The socket is gone with the handler, so a panic can only be logged
        contain_panic("Tunnel", peer, tunnel::handle_raw_connect(ctx, kind, stream, peer, head, buf))
            .await;
        return;
    }

    let io = TokioIo::new(Rewind::new(buf.freeze(), stream));
    let service_ctx = ctx.clone();
    let service = service_fn(move |req| {
        let ctx = service_ctx.clone();
        async move { handle_request(ctx, kind, req, peer).await }
    });

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!("{} connection error from {}: {}", kind.label(), peer, e);
            }
        }
        _ = ctx.shutdown.drain.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                _ = conn.as_mut() => {}
                _ = ctx.shutdown.terminate.cancelled() => {}
            }
        }
    }
}

/// Returns false if `handler` panicked
async fn contain_panic<F>(what: &str, peer: SocketAddr, handler: F) -> bool
where
    F: std::future::Future<Output = ()>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(()) => true,
        Err(_) => {
            error!("{} handler for {} panicked", what, peer);
            false
        }
    }
}

/// Top of each request: panics become a 500 instead of killing the connection task
async fn handle_request(
    ctx: Arc<HandlerContext>,
    kind: EndpointKind,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    match AssertUnwindSafe(dispatch(ctx, kind, req, peer))
        .catch_unwind()
        .await
    {
        Ok(response) => Ok(response),
        Err(_) => {
            error!("Request handler for {} panicked", peer);
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
            ))
        }
    }
}

async fn dispatch(
    ctx: Arc<HandlerContext>,
    kind: EndpointKind,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<ProxyBody> {
    let client_ip = peer.ip().to_string();
    let authorization = req
        .headers()
        .get(PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ctx.access_line(
        req.method().as_str(),
        &req.uri().to_string(),
        authorization.as_deref(),
        &client_ip,
    );

    if req.method() == Method::CONNECT {
        return tunnel::handle_upgrade_connect(ctx, kind, req, peer, authorization).await;
    }

    let target = match Target::from_uri(req.uri()) {
        Ok(target) => target,
        Err(e) => {
            debug!("Bad request target from {}: {}", client_ip, e);
            return text_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    let admission = match ctx
        .admit(&client_ip, authorization.as_deref(), &target.host)
        .await
    {
        Ok(admission) => admission,
        Err(denial) => return denial.response(kind),
    };

    forward::forward(&ctx, kind, req, target, admission, &client_ip).await
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// A complete HTTP/1.1 response for a socket outside hyper
pub fn raw_response(status: StatusCode, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    out.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    out
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
