//! CONNECT tunnels
//!
//! A `CONNECT` that opens a connection is answered on the bare socket; one
//! that arrives later on a kept-alive connection goes through hyper's
//! upgrade machinery. Both end up in [`relay`].

use crate::audit::{Action, AuditLogger, Level};
use crate::endpoint::{
    empty_body, raw_response, text_response, Admission, EndpointKind, HandlerContext, ProxyBody,
};
use crate::forward::EventTemplate;
use crate::io::RequestHead;
use bytes::BytesMut;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::http::uri::Authority;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sent to the client once the upstream connection is open
pub const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const RELAY_BUFFER: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid CONNECT target {0:?}")]
    BadTarget(String),

    #[error("unable to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {host} timed out after {secs}s")]
    Timeout { host: String, secs: u64 },
}

/// `host:port` from a CONNECT request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Without IPv6 brackets
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Port defaults to 443
    pub fn parse(target: &str) -> Result<Self, TunnelError> {
        let authority: Authority = target
            .parse()
            .map_err(|_| TunnelError::BadTarget(target.to_string()))?;

        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TunnelError::BadTarget(target.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port: authority.port_u16().unwrap_or(443),
        })
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

async fn connect_upstream(target: &ConnectTarget, limit: Duration) -> Result<TcpStream, TunnelError> {
    match timeout(limit, TcpStream::connect((target.host.as_str(), target.port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(TunnelError::Connect {
            host: target.host.clone(),
            source,
        }),
        Err(_) => Err(TunnelError::Timeout {
            host: target.host.clone(),
            secs: limit.as_secs(),
        }),
    }
}

fn unreachable_message(target: &ConnectTarget) -> String {
    format!("Proxy request failed: unable to reach {}", target.host)
}

fn template_for(admission: &Admission, client_ip: &str, target: &ConnectTarget) -> EventTemplate {
    EventTemplate {
        session_id: admission.session.id().to_string(),
        username: admission.principal.username.clone(),
        client_ip: client_ip.to_string(),
        target_host: target.host.clone(),
    }
}

fn record_connect_failure(audit: &AuditLogger, template: &EventTemplate, error: &TunnelError) {
    warn!(session = %template.session_id, "Tunnel failed: {}", error);
    audit.record(template.event(Level::Error, Action::Error, error.to_string()));
}

fn record_established(audit: &AuditLogger, template: &EventTemplate, target: &ConnectTarget) {
    debug!(session = %template.session_id, "Tunnel to {} established", target);
    audit.record(template.event(
        Level::Info,
        Action::HttpsTunnel,
        format!("tunnel to {} established", target),
    ));
}

fn record_relay_end(audit: &AuditLogger, template: &EventTemplate, summary: &RelaySummary) {
    let (level, action) = if summary.end.is_error() {
        (Level::Error, Action::Error)
    } else {
        (Level::Info, Action::Disconnect)
    };
    audit.record(template.event(
        level,
        action,
        format!(
            "{} ({} bytes sent, {} bytes received)",
            summary.end, summary.client_to_upstream, summary.upstream_to_client
        ),
    ));
}

async fn reject<S>(client: &mut S, response: String)
where
    S: AsyncWrite + Unpin,
{
    let _ = client.write_all(response.as_bytes()).await;
    let _ = client.shutdown().await;
}

/// `CONNECT` as the first request on a connection; answered with raw bytes
pub async fn handle_raw_connect<S>(
    ctx: Arc<HandlerContext>,
    kind: EndpointKind,
    mut client: S,
    peer: SocketAddr,
    head: RequestHead,
    buf: BytesMut,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client_ip = peer.ip().to_string();
    let authorization = head.proxy_authorization.as_deref();
    ctx.access_line("CONNECT", &head.target, authorization, &client_ip);

    let target = match ConnectTarget::parse(&head.target) {
        Ok(target) => target,
        Err(e) => {
            debug!("Rejecting CONNECT from {}: {}", client_ip, e);
            reject(&mut client, raw_response(StatusCode::BAD_REQUEST, &[], &e.to_string())).await;
            return;
        }
    };

    let admission = match ctx.admit(&client_ip, authorization, &target.host).await {
        Ok(admission) => admission,
        Err(denial) => {
            reject(&mut client, denial.raw_response(kind)).await;
            return;
        }
    };
    let template = template_for(&admission, &client_ip, &target);

    let mut upstream = match connect_upstream(&target, ctx.timeouts.upstream).await {
        Ok(upstream) => upstream,
        Err(e) => {
            record_connect_failure(&ctx.audit, &template, &e);
            let response = raw_response(StatusCode::BAD_GATEWAY, &[], &unreachable_message(&target));
            reject(&mut client, response).await;
            return;
        }
    };

    if let Err(e) = client.write_all(ESTABLISHED).await {
        debug!(session = %template.session_id, "Client left before tunnel start: {}", e);
        ctx.audit.record(template.event(
            Level::Info,
            Action::Disconnect,
            "client closed before tunnel start",
        ));
        return;
    }

    let early = &buf[head.head_len..];
    if !early.is_empty() {
        if let Err(e) = upstream.write_all(early).await {
            let error = TunnelError::Connect {
                host: target.host.clone(),
                source: e,
            };
            record_connect_failure(&ctx.audit, &template, &error);
            return;
        }
    }

    record_established(&ctx.audit, &template, &target);
    let summary = relay(
        client,
        upstream,
        ctx.timeouts.tunnel_idle,
        ctx.shutdown.terminate.clone(),
    )
    .await;
    record_relay_end(&ctx.audit, &template, &summary);

    drop(admission);
}

/// `CONNECT` on a connection hyper already owns
pub async fn handle_upgrade_connect(
    ctx: Arc<HandlerContext>,
    kind: EndpointKind,
    req: Request<Incoming>,
    peer: SocketAddr,
    authorization: Option<String>,
) -> Response<ProxyBody> {
    let client_ip = peer.ip().to_string();
    let raw_target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_else(|| req.uri().to_string());

    let target = match ConnectTarget::parse(&raw_target) {
        Ok(target) => target,
        Err(e) => return text_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let admission = match ctx
        .admit(&client_ip, authorization.as_deref(), &target.host)
        .await
    {
        Ok(admission) => admission,
        Err(denial) => return denial.tunnel_response(kind),
    };
    let template = template_for(&admission, &client_ip, &target);

    let upstream = match connect_upstream(&target, ctx.timeouts.upstream).await {
        Ok(upstream) => upstream,
        Err(e) => {
            record_connect_failure(&ctx.audit, &template, &e);
            return text_response(StatusCode::BAD_GATEWAY, &unreachable_message(&target));
        }
    };

    record_established(&ctx.audit, &template, &target);

    let task_ctx = ctx.clone();
    ctx.tasks.spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let summary = relay(
                    TokioIo::new(upgraded),
                    upstream,
                    task_ctx.timeouts.tunnel_idle,
                    task_ctx.shutdown.terminate.clone(),
                )
                .await;
                record_relay_end(&task_ctx.audit, &template, &summary);
            }
            Err(e) => {
                warn!(session = %template.session_id, "CONNECT upgrade failed: {}", e);
                task_ctx.audit.record(template.event(
                    Level::Error,
                    Action::Error,
                    format!("upgrade failed: {}", e),
                ));
            }
        }
        drop(admission);
    });

    let mut response = Response::new(empty_body());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// How a relay ended
#[derive(Debug)]
pub enum RelayEnd {
    ClientClosed,
    UpstreamClosed,
    IdleTimeout,
    Shutdown,
    ClientError(io::Error),
    UpstreamError(io::Error),
}

impl RelayEnd {
    pub fn is_error(&self) -> bool {
        matches!(self, RelayEnd::ClientError(_) | RelayEnd::UpstreamError(_))
    }
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::ClientClosed => write!(f, "client closed"),
            RelayEnd::UpstreamClosed => write!(f, "upstream closed"),
            RelayEnd::IdleTimeout => write!(f, "idle timeout"),
            RelayEnd::Shutdown => write!(f, "proxy shutting down"),
            RelayEnd::ClientError(e) => write!(f, "client error: {}", e),
            RelayEnd::UpstreamError(e) => write!(f, "upstream error: {}", e),
        }
    }
}

#[derive(Debug)]
pub struct RelaySummary {
    pub end: RelayEnd,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Last time a byte moved in either direction
struct Activity {
    base: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = u64::try_from(self.base.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn quiet_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.base.elapsed().saturating_sub(last)
    }
}

enum PipeEnd {
    Eof,
    ReadError(io::Error),
    WriteError(io::Error),
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W, activity: &Activity, total: &mut u64) -> PipeEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return PipeEnd::Eof,
            Ok(n) => n,
            Err(e) => return PipeEnd::ReadError(e),
        };
        activity.touch();

        if let Err(e) = writer.write_all(&buf[..n]).await {
            return PipeEnd::WriteError(e);
        }
        if let Err(e) = writer.flush().await {
            return PipeEnd::WriteError(e);
        }
        *total += n as u64;
        activity.touch();
    }
}

async fn idle_watchdog(activity: &Activity, idle: Duration) {
    loop {
        let quiet = activity.quiet_for();
        if quiet >= idle {
            return;
        }
        tokio::time::sleep(idle - quiet).await;
    }
}

/// Splice bytes both ways until either side closes, errors, idles out or `cancel` fires
pub async fn relay<C, U>(client: C, upstream: U, idle: Duration, cancel: CancellationToken) -> RelaySummary
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let activity = Activity::new();
    let mut client_to_upstream = 0u64;
    let mut upstream_to_client = 0u64;

    let end = {
        let outbound = pipe(
            &mut client_read,
            &mut upstream_write,
            &activity,
            &mut client_to_upstream,
        );
        let inbound = pipe(
            &mut upstream_read,
            &mut client_write,
            &activity,
            &mut upstream_to_client,
        );
        let watchdog = idle_watchdog(&activity, idle);
        tokio::pin!(outbound, inbound, watchdog);

        tokio::select! {
            end = &mut outbound => match end {
                PipeEnd::Eof => RelayEnd::ClientClosed,
                PipeEnd::ReadError(e) => RelayEnd::ClientError(e),
                PipeEnd::WriteError(e) => RelayEnd::UpstreamError(e),
            },
            end = &mut inbound => match end {
                PipeEnd::Eof => RelayEnd::UpstreamClosed,
                PipeEnd::ReadError(e) => RelayEnd::UpstreamError(e),
                PipeEnd::WriteError(e) => RelayEnd::ClientError(e),
            },
            _ = &mut watchdog => RelayEnd::IdleTimeout,
            _ = cancel.cancelled() => RelayEnd::Shutdown,
        }
    };

    // Closing one leg closes the other
    let grace = Duration::from_secs(1);
    let _ = timeout(grace, upstream_write.shutdown()).await;
    let _ = timeout(grace, client_write.shutdown()).await;

    if matches!(end, RelayEnd::IdleTimeout) {
        info!("Tunnel idle for {}s, closing", idle.as_secs());
    }

    RelaySummary {
        end,
        client_to_upstream,
        upstream_to_client,
    }
}
