//! Proxy orchestrator
//! Wires the store, tracker and audit logger to the HTTP and HTTPS endpoints
//! and owns their shutdown order

use crate::audit::{AuditConfig, AuditLogger};
use crate::auth::AuthValidator;
use crate::certificate::{client_connector, load_server_config};
use crate::database::{Database, LogStats, ServerRecord};
use crate::endpoint::{HandlerContext, ProxyEndpoint, Shutdown, Timeouts};
use crate::tracker::{ConnectionStats, ConnectionTracker, SWEEP_INTERVAL};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use serde::Serialize;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
const AUDIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
const TERMINATE_WAIT: Duration = Duration::from_secs(1);

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub http_port: u16,
    pub https_port: u16,
    pub ssl_enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    /// 0 disables the per-IP limit
    pub max_connections_per_ip: u32,
    pub audit: AuditConfig,
    pub db_path: PathBuf,
    /// Selects a persisted server row that overrides ports and TLS settings
    pub server_id: Option<i64>,
    /// 0 keeps connection logs forever
    pub log_retention_days: u32,
    pub timeouts: Timeouts,
    /// Trusted in addition to the webpki roots when talking to HTTPS origins
    pub extra_roots: Vec<CertificateDer<'static>>,
    /// How long in-flight requests and tunnels get to finish on stop
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8082,
            https_port: 8083,
            ssl_enabled: false,
            cert_path: None,
            key_path: None,
            passphrase: None,
            max_connections_per_ip: 100,
            audit: AuditConfig::default(),
            db_path: PathBuf::from("./data/proxy.db"),
            server_id: None,
            log_retention_days: 30,
            timeouts: Timeouts::default(),
            extra_roots: Vec::new(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ProxyConfig {
    /// Take ports, TLS flag and certificate paths from a server row
    pub fn apply_server_record(&mut self, record: &ServerRecord) {
        self.http_port = record.http_port;
        if let Some(port) = record.https_port {
            self.https_port = port;
        }
        self.ssl_enabled = record.ssl_enabled;
        if record.cert_path.is_some() {
            self.cert_path = record.cert_path.clone();
        }
        if record.key_path.is_some() {
            self.key_path = record.key_path.clone();
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("credential store unavailable: {0:#}")]
    Store(anyhow::Error),

    #[error("server {0} not found")]
    ServerNotFound(i64),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("proxy is already running")]
    AlreadyRunning,
}

impl StartError {
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, StartError::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

/// Addresses the endpoints actually bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundAddrs {
    pub http: SocketAddr,
    /// `None` when TLS is disabled or failed to load
    pub https: Option<SocketAddr>,
}

/// Projection of live state; never persisted
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub is_running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub pid: u32,
    /// Seconds
    #[serde(rename = "uptime")]
    pub uptime_secs: u64,
    pub addrs: Option<BoundAddrs>,
    pub connection_stats: ConnectionStats,
}

struct Running {
    started: DateTime<Utc>,
    db: Arc<Database>,
    addrs: BoundAddrs,
    accept_stop: CancellationToken,
    accept_loops: Vec<JoinHandle<()>>,
    background_stop: CancellationToken,
    background: Vec<JoinHandle<()>>,
    shutdown: Shutdown,
    tasks: TaskTracker,
    audit: AuditLogger,
    audit_writer: JoinHandle<()>,
}

/// Starts and stops one proxy instance
pub struct ProxyOrchestrator {
    config: ProxyConfig,
    tracker: Arc<ConnectionTracker>,
    running: Mutex<Option<Running>>,
}

impl ProxyOrchestrator {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            tracker: Arc::new(ConnectionTracker::new()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// Bring the endpoints up. Only a store failure or an HTTP bind failure is fatal.
    pub async fn start(&self) -> Result<BoundAddrs, StartError> {
        if self.running.lock().is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let mut config = self.config.clone();

        let db = Arc::new(Database::open(&config.db_path).map_err(StartError::Store)?);
        info!("Database initialized at: {}", db.db_path().display());

        if let Some(id) = config.server_id {
            let record = db
                .get_server(id)
                .map_err(StartError::Store)?
                .ok_or(StartError::ServerNotFound(id))?;
            info!("Using server configuration '{}' (id {})", record.name, record.id);
            config.apply_server_record(&record);
        }

        let connector = client_connector(&config.extra_roots).map_err(StartError::Store)?;

        let background_stop = CancellationToken::new();
        let mut background = vec![self
            .tracker
            .spawn_sweeper(SWEEP_INTERVAL, background_stop.clone())];

        let (audit, audit_writer) = AuditLogger::spawn(db.clone(), config.audit);
        if config.log_retention_days > 0 {
            background.push(spawn_retention(
                db.clone(),
                config.log_retention_days,
                background_stop.clone(),
            ));
        }

        let shutdown = Shutdown::default();
        let tasks = TaskTracker::new();
        let ctx = Arc::new(HandlerContext {
            auth: AuthValidator::new(db.clone()),
            tracker: self.tracker.clone(),
            audit: audit.clone(),
            connector,
            max_connections_per_ip: config.max_connections_per_ip,
            timeouts: config.timeouts,
            shutdown: shutdown.clone(),
            tasks: tasks.clone(),
        });

        let abort_start = |e: StartError| {
            background_stop.cancel();
            e
        };

        let http_addr = resolve(&config.host, config.http_port)
            .await
            .map_err(abort_start)?;
        let http = ProxyEndpoint::bind(http_addr, None, ctx.clone())
            .await
            .map_err(|source| StartError::Bind {
                addr: http_addr.to_string(),
                source,
            })
            .map_err(abort_start)?;
        let http_bound = http.local_addr().unwrap_or(http_addr);

        let https = if config.ssl_enabled {
            self.bind_https(&config, ctx.clone()).await
        } else {
            None
        };
        let https_bound = https
            .as_ref()
            .and_then(|endpoint| endpoint.local_addr().ok());

        let accept_stop = CancellationToken::new();
        let mut accept_loops = vec![tokio::spawn(http.run(accept_stop.clone()))];
        if let Some(https) = https {
            accept_loops.push(tokio::spawn(https.run(accept_stop.clone())));
        }

        let addrs = BoundAddrs {
            http: http_bound,
            https: https_bound,
        };

        let mut running = self.running.lock();
        if running.is_some() {
            // Lost a race with a concurrent start
            accept_stop.cancel();
            background_stop.cancel();
            return Err(StartError::AlreadyRunning);
        }
        *running = Some(Running {
            started: Utc::now(),
            db,
            addrs,
            accept_stop,
            accept_loops,
            background_stop,
            background,
            shutdown,
            tasks,
            audit,
            audit_writer,
        });

        info!("Proxy started (HTTP {}, HTTPS {})", addrs.http, match addrs.https {
            Some(addr) => addr.to_string(),
            None => "disabled".to_string(),
        });

        Ok(addrs)
    }

    /// TLS problems leave the proxy running HTTP-only
    async fn bind_https(&self, config: &ProxyConfig, ctx: Arc<HandlerContext>) -> Option<ProxyEndpoint> {
        let (cert_path, key_path) = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                warn!("SSL enabled but certificate or key path missing, running HTTP only");
                return None;
            }
        };

        let acceptor = match load_server_config(cert_path, key_path, config.passphrase.as_deref()) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                warn!("Failed to load TLS material, running HTTP only: {:#}", e);
                return None;
            }
        };

        let addr = match resolve(&config.host, config.https_port).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("{}, running HTTP only", e);
                return None;
            }
        };

        match ProxyEndpoint::bind(addr, Some(acceptor), ctx).await {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!("Failed to bind HTTPS endpoint {}: {}, running HTTP only", addr, e);
                None
            }
        }
    }

    /// Stop accepting, drain, then cut off whatever is left. Safe to call repeatedly.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            debug!("Stop requested but proxy is not running");
            return;
        };

        info!("Stopping proxy");

        running.accept_stop.cancel();
        for handle in running.accept_loops {
            let _ = handle.await;
        }

        running.shutdown.drain.cancel();
        running.tasks.close();

        let in_flight = running.tasks.len();
        if in_flight > 0 {
            info!("Waiting up to {}s for {} connections", self.config.shutdown_grace.as_secs(), in_flight);
        }

        if tokio::time::timeout(self.config.shutdown_grace, running.tasks.wait())
            .await
            .is_err()
        {
            warn!("{} connections still open after grace period, closing them", running.tasks.len());
            running.shutdown.terminate.cancel();
            let _ = tokio::time::timeout(TERMINATE_WAIT, running.tasks.wait()).await;
        }
        running.shutdown.terminate.cancel();

        running.background_stop.cancel();
        for handle in running.background {
            let _ = handle.await;
        }

        self.tracker.clear();

        if !running.audit.flush(AUDIT_FLUSH_TIMEOUT).await {
            warn!("Audit log did not flush before shutdown");
        }
        drop(running.audit);
        running.audit_writer.abort();

        info!("Proxy stopped");
    }

    pub fn status(&self) -> RuntimeStatus {
        let running = self.running.lock();
        let (start_time, addrs) = match running.as_ref() {
            Some(running) => (Some(running.started), Some(running.addrs)),
            None => (None, None),
        };
        let uptime_secs = start_time
            .map(|started| (Utc::now() - started).num_seconds().max(0) as u64)
            .unwrap_or(0);

        RuntimeStatus {
            is_running: running.is_some(),
            start_time,
            pid: std::process::id(),
            uptime_secs,
            addrs,
            connection_stats: self.tracker.stats(),
        }
    }

    /// Connection log totals; `None` while stopped or if the store fails
    pub async fn log_stats(&self) -> Option<LogStats> {
        let db = self.running.lock().as_ref()?.db.clone();
        match tokio::task::spawn_blocking(move || db.log_stats()).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => {
                warn!("Reading log statistics failed: {}", e);
                None
            }
            Err(e) => {
                warn!("Log statistics task failed: {}", e);
                None
            }
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, StartError> {
    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let bind_error = |source: io::Error| StartError::Bind {
        addr: format!("{}:{}", host, port),
        source,
    };
    lookup_host((host, port))
        .await
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| bind_error(io::Error::new(io::ErrorKind::NotFound, "host did not resolve")))
}

fn spawn_retention(db: Arc<Database>, days: u32, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let db = db.clone();
                    match tokio::task::spawn_blocking(move || db.purge_events_older_than(days)).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(purged)) => info!("Purged {} connection log rows older than {} days", purged, days),
                        Ok(Err(e)) => warn!("Log retention purge failed: {:#}", e),
                        Err(e) => warn!("Log retention task failed: {}", e),
                    }
                }
            }
        }
    })
}
