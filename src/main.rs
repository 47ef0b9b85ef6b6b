//! AuthProxy - Main entry point
//!
//! Runs one proxy instance until SIGINT/SIGTERM

use anyhow::Result;
use authproxy::supervisor::{failed_line, ready_line};
use authproxy::{AuditConfig, ProxyConfig, ProxyOrchestrator};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const SHUTDOWN_CEILING: Duration = Duration::from_secs(8);

/// AuthProxy - An authenticating HTTP/HTTPS forward proxy
#[derive(Parser, Debug)]
#[command(name = "authproxy")]
#[command(author = "AuthProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "An authenticating HTTP/HTTPS forward proxy")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// HTTP port to listen on
    #[arg(long, env = "PROXY_HTTP_PORT", default_value_t = 8082)]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "PROXY_HTTPS_PORT", default_value_t = 8083)]
    https_port: u16,

    /// Enable the TLS-terminated endpoint
    #[arg(long, env = "PROXY_SSL_ENABLED", default_value_t = false, action = ArgAction::Set)]
    ssl_enabled: bool,

    /// PEM certificate (chain) for the HTTPS endpoint
    #[arg(long, env = "PROXY_SSL_CERT")]
    ssl_cert: Option<PathBuf>,

    /// PEM private key for the HTTPS endpoint
    #[arg(long, env = "PROXY_SSL_KEY")]
    ssl_key: Option<PathBuf>,

    /// Private key passphrase (encrypted keys are rejected)
    #[arg(long, env = "PROXY_SSL_PASSPHRASE", hide_env_values = true)]
    ssl_passphrase: Option<String>,

    /// Concurrent connections per client IP, 0 for unlimited
    #[arg(long, env = "PROXY_MAX_CONN_IP", default_value_t = 100)]
    max_conn_ip: u32,

    /// Access lines and persisted connection events
    #[arg(long, env = "PROXY_ENABLE_LOGS", default_value_t = true, action = ArgAction::Set)]
    enable_logs: bool,

    /// Echo every connection event at debug level
    #[arg(long, env = "PROXY_DETAILED_LOGS", default_value_t = false, action = ArgAction::Set)]
    detailed_logs: bool,

    /// Only errors on the console
    #[arg(long, env = "PROXY_SILENT", default_value_t = false, action = ArgAction::Set)]
    silent: bool,

    /// Log level
    #[arg(long, env = "PROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Persisted server configuration to run
    #[arg(long, env = "PROXY_SERVER_ID")]
    server_id: Option<i64>,

    /// Days of connection logs to keep, 0 keeps everything
    #[arg(long, env = "PROXY_LOG_RETENTION_DAYS", default_value_t = 30)]
    log_retention_days: u32,

    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/proxy.db")]
    db_path: PathBuf,
}

impl Args {
    fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            host: self.host.clone(),
            http_port: self.http_port,
            https_port: self.https_port,
            ssl_enabled: self.ssl_enabled,
            cert_path: self.ssl_cert.clone(),
            key_path: self.ssl_key.clone(),
            passphrase: self.ssl_passphrase.clone(),
            max_connections_per_ip: self.max_conn_ip,
            audit: AuditConfig {
                enable_logs: self.enable_logs,
                detailed: self.detailed_logs,
                silent: self.silent,
            },
            db_path: self.db_path.clone(),
            server_id: self.server_id,
            log_retention_days: self.log_retention_days,
            ..ProxyConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.silent {
        EnvFilter::new("error")
    } else {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting AuthProxy v1.0.0");

    let proxy = ProxyOrchestrator::new(args.proxy_config());

    let addrs = match proxy.start().await {
        Ok(addrs) => addrs,
        Err(e) => {
            error!("Failed to start proxy: {}", e);
            eprintln!("{}", failed_line(e.is_addr_in_use(), &e.to_string()));
            std::process::exit(1);
        }
    };

    println!("{}", ready_line(std::process::id(), addrs.http, addrs.https));

    shutdown_signal().await;

    if let Some(stats) = proxy.log_stats().await {
        info!("Connection log: {} events today, {} total", stats.today, stats.total);
    }

    if tokio::time::timeout(SHUTDOWN_CEILING, proxy.stop()).await.is_err() {
        error!("Shutdown took longer than {}s, exiting", SHUTDOWN_CEILING.as_secs());
        std::process::exit(1);
    }

    Ok(())
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
