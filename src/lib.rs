//! AuthProxy - An authenticating multi-tenant forward proxy
//!
//! Provides:
//! - Plain HTTP forwarding and `CONNECT` tunnels behind `Basic` proxy auth
//! - Per-IP and per-user concurrent connection quotas
//! - Connection audit log in SQLite
//! - An optional TLS-terminated listener
//! - A supervisor that runs the proxy as a child process

pub mod audit;
pub mod auth;
pub mod certificate;
pub mod database;
pub mod endpoint;
pub mod forward;
pub mod headers;
pub mod io;
pub mod proxy;
pub mod supervisor;
pub mod tracker;
pub mod tunnel;

pub use audit::{AuditConfig, AuditLogger};
pub use auth::{AuthValidator, Principal};
pub use database::Database;
pub use proxy::{ProxyConfig, ProxyOrchestrator, RuntimeStatus, StartError};
pub use supervisor::{ProcessSupervisor, SupervisorConfig};
pub use tracker::ConnectionTracker;
