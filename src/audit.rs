//! Audit logging
//!
//! Console lines go through `tracing`; connection events are queued to a
//! background writer that appends them to a [`LogSink`]. Queueing never
//! blocks and sink failures are only reported locally.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// What a connection-log row records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Connect,
    Disconnect,
    AuthSuccess,
    AuthFailed,
    Error,
    HttpRequest,
    HttpsRequest,
    HttpsTunnel,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Connect => "connect",
            Action::Disconnect => "disconnect",
            Action::AuthSuccess => "auth_success",
            Action::AuthFailed => "auth_failed",
            Action::Error => "error",
            Action::HttpRequest => "http_request",
            Action::HttpsRequest => "https_request",
            Action::HttpsTunnel => "https_tunnel",
        }
    }
}

/// One persisted connection event
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    /// `None` before a session has been admitted
    pub session_id: Option<String>,
    pub message: String,
    pub action: Action,
    pub username: String,
    pub client_ip: String,
    pub target_host: String,
}

impl LogEvent {
    pub fn new(level: Level, action: Action, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            session_id: None,
            message: message.into(),
            action,
            username: String::new(),
            client_ip: String::new(),
            target_host: String::new(),
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn user(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn client(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = client_ip.into();
        self
    }

    pub fn target(mut self, target_host: impl Into<String>) -> Self {
        self.target_host = target_host.into();
        self
    }
}

/// Destination for persisted events
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, event: &LogEvent) -> Result<()>;
}

/// Verbosity flags
#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    /// Info-level console lines and every persisted event
    pub enable_logs: bool,
    /// Echo every recorded event at debug level
    pub detailed: bool,
    /// Only errors reach the console
    pub silent: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enable_logs: true,
            detailed: false,
            silent: false,
        }
    }
}

enum Command {
    Event(Box<LogEvent>),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget logging port shared by all handlers
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<Command>,
    config: AuditConfig,
}

impl AuditLogger {
    /// Start the background writer for `sink`
    pub fn spawn(sink: Arc<dyn LogSink>, config: AuditConfig) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Command>(QUEUE_CAPACITY);

        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Event(event) => {
                        if let Err(e) = sink.append(&event).await {
                            warn!("Failed to persist {} event: {:#}", event.action.as_str(), e);
                        }
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        (Self { tx, config }, handle)
    }

    pub fn config(&self) -> AuditConfig {
        self.config
    }

    /// Console line, filtered by the verbosity flags
    pub fn log(&self, level: Level, message: &str) {
        match level {
            Level::Error => error!("{}", message),
            _ if self.config.silent => {}
            Level::Warn => warn!("{}", message),
            Level::Info if self.config.enable_logs => info!("{}", message),
            Level::Info => {}
            Level::Debug if self.config.detailed => debug!("{}", message),
            Level::Debug => {}
        }
    }

    /// Queue an event for the sink; drops it if the queue is full
    pub fn record(&self, event: LogEvent) {
        if self.config.detailed && !self.config.silent {
            debug!(
                session = event.session_id.as_deref().unwrap_or("-"),
                action = event.action.as_str(),
                user = %event.username,
                client = %event.client_ip,
                target = %event.target_host,
                "{}",
                event.message
            );
        }

        if !self.config.enable_logs {
            return;
        }

        match self.tx.try_send(Command::Event(Box::new(event))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Audit queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Audit writer stopped, dropping event");
            }
        }
    }

    /// Wait until everything queued so far has reached the sink
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        let flushed = async {
            self.tx.send(Command::Flush(done_tx)).await.ok()?;
            done_rx.await.ok()
        };
        matches!(tokio::time::timeout(timeout, flushed).await, Ok(Some(())))
    }
}
