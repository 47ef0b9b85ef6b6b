//! Supervisor CLI
//!
//! Usage:
//!   authproxy-supervisor --server-id <id> [--proxy-program <path>] [--db-path <path>]

use anyhow::{Context, Result};
use authproxy::{ProcessSupervisor, SupervisorConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const SHUTDOWN_CEILING: Duration = Duration::from_secs(8);
const CHILD_POLL: Duration = Duration::from_secs(1);

/// Runs one proxy server configuration as a supervised child process
#[derive(Parser, Debug)]
#[command(name = "authproxy-supervisor")]
#[command(author = "AuthProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Launch and supervise an AuthProxy instance")]
struct Args {
    /// Server record to launch
    #[arg(long)]
    server_id: i64,

    /// Proxy binary; defaults to `authproxy` next to this executable
    #[arg(long, env = "AUTHPROXY_PROGRAM")]
    proxy_program: Option<PathBuf>,

    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/proxy.db")]
    db_path: PathBuf,

    /// Address the proxy listens on
    #[arg(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Skip the `pkill` sweep for leftover proxies
    #[arg(long)]
    no_stale_sweep: bool,
}

fn default_program() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    let name = if cfg!(windows) { "authproxy.exe" } else { "authproxy" };
    Ok(exe.with_file_name(name))
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    let program = match args.proxy_program {
        Some(program) => program,
        None => default_program()?,
    };

    let mut config = SupervisorConfig::new(program, args.db_path);
    config.listen_host = args.host;
    if args.no_stale_sweep {
        config.stale_pattern = None;
    }

    let supervisor = ProcessSupervisor::new(config)?;
    supervisor.reset_statuses()?;

    let launched = supervisor.launch(args.server_id).await?;
    info!(
        "Server {} running as pid {}{}",
        launched.server_id,
        launched.pid,
        launched
            .http
            .map(|addr| format!(" on {}", addr))
            .unwrap_or_default()
    );
    // One JSON line for whatever launched us
    println!("{}", serde_json::to_string(&launched)?);

    let child_exited = async {
        let mut ticker = tokio::time::interval(CHILD_POLL);
        loop {
            ticker.tick().await;
            if !supervisor.status().running {
                break;
            }
        }
    };

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = child_exited => {
            error!("Proxy exited, supervisor shutting down");
            std::process::exit(1);
        }
    }

    match tokio::time::timeout(SHUTDOWN_CEILING, supervisor.terminate()).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            warn!("Stopping proxy failed: {}", e);
            Ok(())
        }
        Err(_) => {
            error!("Shutdown took longer than {}s, exiting", SHUTDOWN_CEILING.as_secs());
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
