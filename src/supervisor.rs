//! Process supervisor
//!
//! Runs the proxy binary as a child process configured from a persisted
//! server row. The child reports startup through one marker line:
//!
//! ```text
//! AUTHPROXY_READY pid=<pid> http=<addr> https=<addr|disabled>     (stdout)
//! AUTHPROXY_FAILED kind=<addr_in_use|error> message=<text>        (stderr, then exit 1)
//! ```

use crate::database::{Database, ServerRecord, ServerStatus};
use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

pub const READY_MARKER: &str = "AUTHPROXY_READY";
pub const FAILED_MARKER: &str = "AUTHPROXY_FAILED";

const STALE_SWEEP_TIMEOUT: Duration = Duration::from_secs(2);
const PORT_RELEASE_WAIT: Duration = Duration::from_secs(3);
const MARKER_DRAIN: Duration = Duration::from_secs(1);

/// The stdout line a proxy prints once its endpoints are listening
pub fn ready_line(pid: u32, http: SocketAddr, https: Option<SocketAddr>) -> String {
    let https = https
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "disabled".to_string());
    format!("{} pid={} http={} https={}", READY_MARKER, pid, http, https)
}

/// The stderr line a proxy prints before exiting on a startup failure
pub fn failed_line(addr_in_use: bool, message: &str) -> String {
    let kind = if addr_in_use { "addr_in_use" } else { "error" };
    let message = message.replace(['\r', '\n'], " ");
    format!("{} kind={} message={}", FAILED_MARKER, kind, message)
}

/// A recognised startup line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Ready { http: Option<SocketAddr> },
    Failed { addr_in_use: bool, message: String },
}

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.split_whitespace()
        .find_map(|part| part.strip_prefix(key)?.strip_prefix('='))
}

pub fn parse_marker(line: &str) -> Option<Marker> {
    let line = line.trim();

    if line.starts_with(READY_MARKER) {
        return Some(Marker::Ready {
            http: field(line, "http").and_then(|addr| addr.parse().ok()),
        });
    }

    if line.starts_with(FAILED_MARKER) {
        let message = line
            .split_once("message=")
            .map(|(_, message)| message.to_string())
            .unwrap_or_default();
        return Some(Marker::Failed {
            addr_in_use: field(line, "kind") == Some("addr_in_use"),
            message,
        });
    }

    None
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub proxy_program: PathBuf,
    pub db_path: PathBuf,
    pub listen_host: String,
    /// `pkill -f` pattern for leftover proxies; `None` skips the sweep
    pub stale_pattern: Option<String>,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(proxy_program: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        let proxy_program = proxy_program.into();
        // Anchored so it does not match e.g. `authproxy-supervisor`
        let stale_pattern = Some(format!(
            "^{}( |$)",
            escape_pattern(&proxy_program.to_string_lossy())
        ));

        Self {
            proxy_program,
            db_path: db_path.into(),
            listen_host: "0.0.0.0".to_string(),
            stale_pattern,
            startup_timeout: Duration::from_secs(15),
            stop_grace: Duration::from_secs(5),
        }
    }
}

fn escape_pattern(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("server {0} is already running")]
    AlreadyRunning(i64),

    #[error("server {0} not found")]
    NotFound(i64),

    #[error("address already in use: {0}")]
    AddrInUse(String),

    #[error("proxy failed to start: {0}")]
    StartupFailed(String),

    #[error("proxy did not report startup within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("proxy exited during startup (code {0:?})")]
    Exited(Option<i32>),

    #[error("failed to spawn proxy: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl LaunchError {
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, LaunchError::AddrInUse(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchInfo {
    pub server_id: i64,
    pub pid: u32,
    pub http: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub server_id: Option<i64>,
    pub pid: Option<u32>,
}

struct Current {
    server_id: i64,
    pid: u32,
    kill: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    current: Option<Current>,
    last_server: Option<i64>,
}

struct Shared {
    config: SupervisorConfig,
    db: Database,
    state: Mutex<State>,
}

/// Launches, watches and stops one proxy child at a time
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    // Serializes launch and terminate
    op: tokio::sync::Mutex<()>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> anyhow::Result<Self> {
        let db = Database::open(&config.db_path)
            .with_context(|| format!("Failed to open {}", config.db_path.display()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                db,
                state: Mutex::new(State::default()),
            }),
            op: tokio::sync::Mutex::new(()),
        })
    }

    /// Children never outlive a supervisor, so nothing persisted as running can be
    pub fn reset_statuses(&self) -> anyhow::Result<usize> {
        let reset = self.shared.db.reset_running_servers()?;
        if reset > 0 {
            info!("Reset {} stale running server statuses", reset);
        }
        Ok(reset)
    }

    pub fn status(&self) -> SupervisorStatus {
        let state = self.shared.state.lock();
        SupervisorStatus {
            running: state.current.is_some(),
            server_id: state.current.as_ref().map(|c| c.server_id),
            pid: state.current.as_ref().map(|c| c.pid),
        }
    }

    /// Start the proxy for `server_id`, stopping a different running server first
    pub async fn launch(&self, server_id: i64) -> Result<LaunchInfo, LaunchError> {
        let _op = self.op.lock().await;

        let running = self.shared.state.lock().current.as_ref().map(|c| c.server_id);
        match running {
            Some(id) if id == server_id => return Err(LaunchError::AlreadyRunning(server_id)),
            Some(id) => {
                info!("Stopping server {} before launching {}", id, server_id);
                self.stop_current().await?;
            }
            None => {}
        }

        let record = self
            .shared
            .db
            .get_server(server_id)?
            .ok_or(LaunchError::NotFound(server_id))?;

        self.clear_stale(&record).await;

        let mut child = self.spawn_child(&record)?;
        let pid = child.id().unwrap_or_default();
        info!("Launched proxy for server {} (pid {})", server_id, pid);

        let (marker_tx, mut markers) = mpsc::channel(8);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(watch_output(stdout, "stdout", marker_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(watch_output(stderr, "stderr", marker_tx.clone()));
        }
        drop(marker_tx);

        let startup = self.shared.config.startup_timeout;
        let outcome = match timeout(startup, await_startup(&mut child, &mut markers)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(LaunchError::Timeout(startup)),
        };

        let http = match outcome {
            Ok(http) => http,
            Err(e) => {
                warn!("Proxy for server {} failed to start: {}", server_id, e);
                let _ = child.kill().await;
                if let Err(e) = self.shared.db.set_server_status(server_id, ServerStatus::Stopped) {
                    warn!("Failed to record server {} as stopped: {:#}", server_id, e);
                }
                return Err(e);
            }
        };

        self.shared.db.set_server_status(server_id, ServerStatus::Running)?;

        let (kill_tx, kill_rx) = oneshot::channel();
        {
            // Registered under the lock so the monitor cannot miss it
            let mut state = self.shared.state.lock();
            let monitor = tokio::spawn(monitor_child(
                self.shared.clone(),
                child,
                server_id,
                pid,
                kill_rx,
            ));
            state.current = Some(Current {
                server_id,
                pid,
                kill: kill_tx,
                monitor,
            });
            state.last_server = Some(server_id);
        }

        Ok(LaunchInfo {
            server_id,
            pid,
            http,
        })
    }

    /// Stop the child; the persisted status ends up stopped either way
    pub async fn terminate(&self) -> Result<bool, LaunchError> {
        let _op = self.op.lock().await;
        self.stop_current().await
    }

    async fn stop_current(&self) -> Result<bool, LaunchError> {
        let (current, last_server) = {
            let mut state = self.shared.state.lock();
            (state.current.take(), state.last_server)
        };

        let Some(current) = current else {
            if let Some(id) = last_server {
                self.shared.db.set_server_status(id, ServerStatus::Stopped)?;
            }
            return Ok(false);
        };

        let Current {
            server_id,
            pid,
            kill,
            mut monitor,
        } = current;
        let grace = self.shared.config.stop_grace;

        if request_exit(pid) {
            if timeout(grace, &mut monitor).await.is_err() {
                warn!("Proxy pid {} ignored SIGTERM for {}s, killing", pid, grace.as_secs());
                let _ = kill.send(());
                let _ = timeout(grace, &mut monitor).await;
            }
        } else {
            let _ = kill.send(());
            let _ = timeout(grace, &mut monitor).await;
        }

        self.shared.db.set_server_status(server_id, ServerStatus::Stopped)?;
        info!("Stopped proxy for server {}", server_id);
        Ok(true)
    }

    async fn clear_stale(&self, record: &ServerRecord) {
        let config = &self.shared.config;

        if let Some(pattern) = &config.stale_pattern {
            let mut sweep = Command::new("pkill");
            sweep
                .arg("-f")
                .arg(pattern)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            match timeout(STALE_SWEEP_TIMEOUT, sweep.status()).await {
                Ok(Ok(status)) if status.success() => info!("Killed stale proxy processes"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("Stale process sweep unavailable: {}", e),
                Err(_) => warn!("Stale process sweep timed out"),
            }
        }

        if !wait_for_port(&config.listen_host, record.http_port, PORT_RELEASE_WAIT).await {
            warn!(
                "Port {} is still in use after {}s",
                record.http_port,
                PORT_RELEASE_WAIT.as_secs()
            );
        }
    }

    fn spawn_child(&self, record: &ServerRecord) -> Result<Child, LaunchError> {
        let config = &self.shared.config;
        let https_port = record.https_port.unwrap_or(8083);

        let mut command = Command::new(&config.proxy_program);
        command
            .env("PROXY_HOST", &config.listen_host)
            .env("PROXY_HTTP_PORT", record.http_port.to_string())
            .env("PROXY_HTTPS_PORT", https_port.to_string())
            .env("PROXY_SSL_ENABLED", record.ssl_enabled.to_string())
            .env("PROXY_SERVER_ID", record.id.to_string())
            .env("DB_PATH", &config.db_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command.spawn().map_err(LaunchError::Spawn)
    }
}

/// First marker wins; an exit before any marker is a failure
async fn await_startup(
    child: &mut Child,
    markers: &mut mpsc::Receiver<Marker>,
) -> Result<Option<SocketAddr>, LaunchError> {
    let marker = tokio::select! {
        biased;
        marker = markers.recv() => marker,
        status = child.wait() => {
            // The failure line may still be in the pipe
            let code = status.ok().and_then(|s| s.code());
            match timeout(MARKER_DRAIN, markers.recv()).await {
                Ok(Some(marker)) => Some(marker),
                _ => return Err(LaunchError::Exited(code)),
            }
        }
    };

    match marker {
        Some(Marker::Ready { http }) => Ok(http),
        Some(Marker::Failed {
            addr_in_use: true,
            message,
        }) => Err(LaunchError::AddrInUse(message)),
        Some(Marker::Failed { message, .. }) => Err(LaunchError::StartupFailed(message)),
        None => {
            let code = child.wait().await.ok().and_then(|s| s.code());
            Err(LaunchError::Exited(code))
        }
    }
}

/// Forward child output to our log and report marker lines
async fn watch_output<R>(stream: R, name: &'static str, markers: mpsc::Sender<Marker>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!("proxy {} | {}", name, line);
                if let Some(marker) = parse_marker(&line) {
                    let _ = markers.send(marker).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Reading proxy {} failed: {}", name, e);
                break;
            }
        }
    }
}

async fn monitor_child(
    shared: Arc<Shared>,
    mut child: Child,
    server_id: i64,
    pid: u32,
    mut kill: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    match status {
        Ok(status) => info!("Proxy pid {} exited: {}", pid, status),
        Err(e) => warn!("Failed to wait for proxy pid {}: {}", pid, e),
    }

    let unexpected = {
        let mut state = shared.state.lock();
        if matches!(&state.current, Some(current) if current.pid == pid) {
            state.current = None;
            true
        } else {
            false
        }
    };

    if unexpected {
        warn!("Proxy for server {} exited unexpectedly", server_id);
        if let Err(e) = shared.db.set_server_status(server_id, ServerStatus::Stopped) {
            warn!("Failed to record server {} as stopped: {:#}", server_id, e);
        }
    }
}

#[cfg(unix)]
fn request_exit(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!("SIGTERM to pid {} failed: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn request_exit(_pid: u32) -> bool {
    false
}

async fn wait_for_port(host: &str, port: u16, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if TcpListener::bind((host, port)).await.is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
