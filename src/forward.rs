//! Plain HTTP forwarding
//!
//! Every admitted request gets its own upstream connection. The response
//! body is streamed back through [`RelayBody`], which owns the session and
//! the upstream connection task, so whichever way the exchange ends the
//! session is released once and the upstream socket is closed.

use crate::audit::{Action, AuditLogger, Level, LogEvent};
use crate::endpoint::{
    empty_body, text_response, Admission, BoxError, EndpointKind, HandlerContext, ProxyBody,
};
use crate::headers::{sanitize_request, sanitize_response};
use crate::tracker::SessionGuard;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, Sleep};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request target must be an absolute http:// or https:// URI")]
    NotAbsolute,

    #[error("unsupported scheme {0}")]
    UnsupportedScheme(String),

    #[error("unable to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS server name {0}")]
    ServerName(String),

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{host} did not respond within {secs}s")]
    Timeout { host: String, secs: u64 },

    #[error("upstream exchange failed: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("failed to build upstream request: {0}")]
    Request(#[from] hyper::http::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Origin parsed from an absolute-form request target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    /// Without IPv6 brackets
    pub host: String,
    pub port: u16,
    /// `Host` header value used when the client sent none
    pub host_header: String,
    pub path_and_query: String,
}

impl Target {
    pub fn from_uri(uri: &Uri) -> Result<Self, ForwardError> {
        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(other) => return Err(ForwardError::UnsupportedScheme(other.to_string())),
            None => return Err(ForwardError::NotAbsolute),
        };

        let authority = uri.authority().ok_or(ForwardError::NotAbsolute)?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(ForwardError::NotAbsolute);
        }

        let default_port = match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        };
        let port = authority.port_u16().unwrap_or(default_port);

        // Userinfo never goes upstream
        let host_header = authority
            .as_str()
            .rsplit('@')
            .next()
            .unwrap_or(authority.host())
            .to_string();

        let path_and_query = match uri.path_and_query().map(|pq| pq.as_str()) {
            Some(pq) if !pq.is_empty() => pq.to_string(),
            _ => "/".to_string(),
        };

        Ok(Self {
            scheme,
            host,
            port,
            host_header,
            path_and_query,
        })
    }
}

/// Identity stamped on every event of one exchange
#[derive(Debug, Clone)]
pub(crate) struct EventTemplate {
    pub session_id: String,
    pub username: String,
    pub client_ip: String,
    pub target_host: String,
}

impl EventTemplate {
    pub fn event(&self, level: Level, action: Action, message: impl Into<String>) -> LogEvent {
        LogEvent::new(level, action, message)
            .session(self.session_id.as_str())
            .user(self.username.as_str())
            .client(self.client_ip.as_str())
            .target(self.target_host.as_str())
    }
}

/// Relay one admitted request to its origin
pub async fn forward(
    ctx: &Arc<HandlerContext>,
    kind: EndpointKind,
    req: Request<Incoming>,
    target: Target,
    admission: Admission,
    client_ip: &str,
) -> Response<ProxyBody> {
    let Admission { principal, session } = admission;
    let template = EventTemplate {
        session_id: session.id().to_string(),
        username: principal.username,
        client_ip: client_ip.to_string(),
        target_host: target.host.clone(),
    };

    ctx.audit.record(template.event(
        Level::Info,
        kind.request_action(),
        format!("{} {}", req.method(), req.uri()),
    ));

    // Dropped with no outcome if the client goes away before the response head
    let mut exchange = Exchange {
        audit: ctx.audit.clone(),
        template,
        outcome: None,
        _session: session,
        _connection: None,
    };

    let limit = ctx.timeouts.upstream;
    let result = match timeout(limit, send_upstream(ctx, req, &target)).await {
        Ok(result) => result,
        Err(_) => Err(ForwardError::Timeout {
            host: target.host.clone(),
            secs: limit.as_secs(),
        }),
    };

    match result {
        Ok((mut response, connection)) => {
            sanitize_response(response.headers_mut(), kind.is_tls());
            let (parts, body) = response.into_parts();

            exchange._connection = Some(connection);
            if body.is_end_stream() {
                exchange.finish(Outcome::Completed);
            }

            Response::from_parts(parts, RelayBody::new(body, limit, exchange).boxed())
        }
        Err(e) => {
            warn!(session = %exchange.template.session_id, "Forwarding to {} failed: {}", target.host, e);
            exchange.finish(Outcome::UpstreamError(e.to_string()));
            drop(exchange);
            text_response(
                StatusCode::BAD_GATEWAY,
                &format!("Proxy request failed: unable to reach {}", target.host),
            )
        }
    }
}

fn upstream_request(req: Request<Incoming>, target: &Target) -> Result<Request<ProxyBody>, ForwardError> {
    let (mut parts, body) = req.into_parts();

    parts.uri = Uri::builder()
        .path_and_query(target.path_and_query.as_str())
        .build()?;
    parts.version = Version::HTTP_11;
    sanitize_request(&mut parts.headers);

    if !parts.headers.contains_key(HOST) {
        let host = HeaderValue::from_str(&target.host_header).map_err(hyper::http::Error::from)?;
        parts.headers.insert(HOST, host);
    }

    let body = if parts.method == Method::GET || parts.method == Method::HEAD {
        empty_body()
    } else {
        body.map_err(BoxError::from).boxed()
    };

    Ok(Request::from_parts(parts, body))
}

async fn send_upstream(
    ctx: &HandlerContext,
    req: Request<Incoming>,
    target: &Target,
) -> Result<(Response<Incoming>, ConnectionTask), ForwardError> {
    let request = upstream_request(req, target)?;

    let tcp = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|source| ForwardError::Connect {
            host: target.host.clone(),
            source,
        })?;
    let _ = tcp.set_nodelay(true);

    match target.scheme {
        Scheme::Http => exchange(tcp, request).await,
        Scheme::Https => {
            let name = ServerName::try_from(target.host.as_str())
                .map(|name| name.to_owned())
                .map_err(|_| ForwardError::ServerName(target.host.clone()))?;
            let tls = ctx
                .connector
                .connect(name, tcp)
                .await
                .map_err(|source| ForwardError::Tls {
                    host: target.host.clone(),
                    source,
                })?;
            exchange(tls, request).await
        }
    }
}

async fn exchange<S>(
    stream: S,
    request: Request<ProxyBody>,
) -> Result<(Response<Incoming>, ConnectionTask), ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .handshake(TokioIo::new(stream))
        .await?;

    let connection = ConnectionTask(tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection error: {}", e);
        }
    }));

    let response = sender.send_request(request).await?;
    Ok((response, connection))
}

/// The upstream connection driver; aborting it closes the socket
struct ConnectionTask(JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
enum Outcome {
    Completed,
    UpstreamError(String),
}

/// Terminal bookkeeping for one forwarded request
struct Exchange {
    audit: AuditLogger,
    template: EventTemplate,
    /// `None` at drop time means the client went away first
    outcome: Option<Outcome>,
    _session: SessionGuard,
    _connection: Option<ConnectionTask>,
}

impl Exchange {
    fn finish(&mut self, outcome: Outcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        let event = match self.outcome.take() {
            Some(Outcome::Completed) => {
                self.template
                    .event(Level::Info, Action::Disconnect, "request completed")
            }
            Some(Outcome::UpstreamError(message)) => {
                self.template.event(Level::Error, Action::Error, message)
            }
            None => self
                .template
                .event(Level::Info, Action::Disconnect, "client aborted"),
        };
        self.audit.record(event);
    }
}

pin_project! {
    /// Upstream response body with an idle limit between frames
    pub struct RelayBody {
        #[pin]
        inner: Incoming,
        #[pin]
        idle: Sleep,
        idle_timeout: Duration,
        exchange: Exchange,
    }
}

impl RelayBody {
    fn new(inner: Incoming, idle_timeout: Duration, exchange: Exchange) -> Self {
        Self {
            inner,
            idle: tokio::time::sleep(idle_timeout),
            idle_timeout,
            exchange,
        }
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                let deadline = Instant::now() + *this.idle_timeout;
                this.idle.as_mut().reset(deadline);
                // hyper may stop polling once a sized body is exhausted
                if this.inner.is_end_stream() {
                    this.exchange.finish(Outcome::Completed);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.exchange
                    .finish(Outcome::UpstreamError(format!("upstream body error: {}", e)));
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.exchange.finish(Outcome::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    let message = format!(
                        "upstream response stalled for {}s",
                        this.idle_timeout.as_secs()
                    );
                    this.exchange
                        .finish(Outcome::UpstreamError(message.clone()));
                    return Poll::Ready(Some(Err(message.into())));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
