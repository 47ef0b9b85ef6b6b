//! Database manager for SQLite operations
//! Holds proxy users, proxy server records and the connection log

use crate::audit::{LogEvent, LogSink};
use crate::auth::{CredentialStore, UserRecord, UserStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persisted lifecycle state of a proxy server record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
        }
    }

    fn parse(value: &str) -> Self {
        if value == "running" {
            ServerStatus::Running
        } else {
            ServerStatus::Stopped
        }
    }
}

/// A persisted proxy server configuration row
#[derive(Debug, Clone, Serialize)]
pub struct ServerRecord {
    pub id: i64,
    pub name: String,
    /// Advertised name only; the listen host always comes from configuration
    pub domain: Option<String>,
    pub http_port: u16,
    pub https_port: Option<u16>,
    pub ssl_enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub status: ServerStatus,
}

/// Aggregate counts over the connection log
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub total: i64,
    pub today: i64,
    pub top_users: Vec<(String, i64)>,
}

/// Thread-safe database manager for SQLite operations
/// Uses a Mutex to ensure only one thread accesses the connection at a time
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl Database {
    /// Open (or create) the database at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;

        // WAL lets the supervisor and the proxy process share the file
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };

        db.initialize()?;

        Ok(db)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS proxy_users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                password TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                max_connections INTEGER NOT NULL DEFAULT 10,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS proxy_servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                domain TEXT DEFAULT NULL,
                http_port INTEGER NOT NULL,
                https_port INTEGER DEFAULT NULL,
                ssl_enabled INTEGER NOT NULL DEFAULT 0,
                cert_path TEXT DEFAULT NULL,
                key_path TEXT DEFAULT NULL,
                status TEXT NOT NULL DEFAULT 'stopped',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS connection_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                client_ip TEXT NOT NULL,
                target_host TEXT NOT NULL,
                action TEXT NOT NULL DEFAULT 'connect',
                level TEXT NOT NULL DEFAULT 'info',
                message TEXT NOT NULL DEFAULT '',
                session_id TEXT DEFAULT NULL,
                created_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_logs_username ON connection_logs(username);
            CREATE INDEX IF NOT EXISTS idx_logs_created_at ON connection_logs(created_at);
            CREATE INDEX IF NOT EXISTS idx_logs_session_id ON connection_logs(session_id);
            CREATE INDEX IF NOT EXISTS idx_servers_status ON proxy_servers(status);",
        )?;

        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Look up an active user; inactive and unknown users are both `None`
    pub fn find_active_user_sync(&self, username: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();

        let user = conn
            .query_row(
                "SELECT username, password, status, max_connections
                 FROM proxy_users WHERE username = ?1 AND status = 'active'",
                params![username],
                |row| {
                    let status: String = row.get(2)?;
                    let max_connections: i64 = row.get(3)?;
                    Ok(UserRecord {
                        username: row.get(0)?,
                        password_hash: row.get(1)?,
                        status: UserStatus::parse(&status),
                        max_connections: u32::try_from(max_connections).unwrap_or(0),
                    })
                },
            )
            .optional()?;

        Ok(user)
    }

    /// Insert a user with an already hashed password
    pub fn insert_user(
        &self,
        username: &str,
        password_hash: &str,
        status: UserStatus,
        max_connections: u32,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO proxy_users (username, password, status, max_connections)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, password_hash, status.as_str(), max_connections],
        )?;
        Ok(())
    }

    /// Change a user's status; returns whether a row was touched
    pub fn set_user_status(&self, username: &str, status: UserStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE proxy_users SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE username = ?2",
            params![status.as_str(), username],
        )?;
        Ok(affected > 0)
    }

    /// Insert a server record and return its id
    pub fn insert_server(
        &self,
        name: &str,
        domain: Option<&str>,
        http_port: u16,
        https_port: Option<u16>,
        ssl_enabled: bool,
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO proxy_servers (name, domain, http_port, https_port, ssl_enabled, cert_path, key_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                name,
                domain,
                http_port,
                https_port,
                ssl_enabled,
                cert_path.map(|p| p.to_string_lossy().to_string()),
                key_path.map(|p| p.to_string_lossy().to_string()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get a server record by id
    pub fn get_server(&self, id: i64) -> Result<Option<ServerRecord>> {
        let conn = self.conn.lock();

        let server = conn
            .query_row(
                "SELECT id, name, domain, http_port, https_port, ssl_enabled, cert_path, key_path, status
                 FROM proxy_servers WHERE id = ?1",
                params![id],
                server_from_row,
            )
            .optional()?;

        Ok(server)
    }

    /// Persist a server's lifecycle status
    pub fn set_server_status(&self, id: i64, status: ServerStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE proxy_servers SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Mark every server as stopped; returns how many were marked running
    pub fn reset_running_servers(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE proxy_servers SET status = 'stopped', updated_at = CURRENT_TIMESTAMP
             WHERE status = 'running'",
            [],
        )?;
        Ok(affected)
    }

    /// Append one event to the connection log
    pub fn append_event(&self, event: &LogEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO connection_logs
                (username, client_ip, target_host, action, level, message, session_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.username,
                event.client_ip,
                event.target_host,
                event.action.as_str(),
                event.level.as_str(),
                event.message,
                event.session_id,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Delete log rows older than `days` days
    pub fn purge_events_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let conn = self.conn.lock();
        let affected = conn.execute(
            "DELETE FROM connection_logs WHERE created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }

    /// List actions recorded for a session, oldest first
    pub fn session_actions(&self, session_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT action FROM connection_logs WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| row.get(0))?;
        let mut actions = Vec::new();
        for action in rows {
            actions.push(action?);
        }
        Ok(actions)
    }

    /// Session ids a user has logged events under, oldest first
    pub fn user_sessions(&self, username: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id FROM connection_logs
             WHERE username = ?1 AND session_id IS NOT NULL
             GROUP BY session_id ORDER BY MIN(id) ASC",
        )?;
        let rows = stmt.query_map(params![username], |row| row.get(0))?;
        let mut sessions = Vec::new();
        for session in rows {
            sessions.push(session?);
        }
        Ok(sessions)
    }

    /// Totals for today and overall plus the ten busiest users today
    pub fn log_stats(&self) -> Result<LogStats> {
        let conn = self.conn.lock();
        let today_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| Utc.from_utc_datetime(&t).to_rfc3339())
            .unwrap_or_default();

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM connection_logs", [], |row| {
            row.get(0)
        })?;

        let today: i64 = conn.query_row(
            "SELECT COUNT(*) FROM connection_logs WHERE created_at >= ?1",
            params![today_start],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT username, COUNT(*) AS count FROM connection_logs
             WHERE created_at >= ?1
             GROUP BY username ORDER BY count DESC LIMIT 10",
        )?;
        let mut rows = stmt.query(params![today_start])?;
        let mut top_users = Vec::new();
        while let Some(row) = rows.next()? {
            top_users.push((row.get(0)?, row.get(1)?));
        }

        Ok(LogStats {
            total,
            today,
            top_users,
        })
    }
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<ServerRecord> {
    let status: String = row.get(8)?;
    let cert_path: Option<String> = row.get(6)?;
    let key_path: Option<String> = row.get(7)?;
    Ok(ServerRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        domain: row.get(2)?,
        http_port: row.get(3)?,
        https_port: row.get(4)?,
        ssl_enabled: row.get(5)?,
        cert_path: cert_path.filter(|p| !p.is_empty()).map(PathBuf::from),
        key_path: key_path.filter(|p| !p.is_empty()).map(PathBuf::from),
        status: ServerStatus::parse(&status),
    })
}

#[async_trait]
impl CredentialStore for Database {
    async fn find_active_user(&self, username: &str) -> Result<Option<UserRecord>> {
        self.find_active_user_sync(username)
    }
}

#[async_trait]
impl LogSink for Database {
    async fn append(&self, event: &LogEvent) -> Result<()> {
        self.append_event(event)
    }
}
