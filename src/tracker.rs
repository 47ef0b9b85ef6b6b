//! Connection tracking
//!
//! Live sessions plus per-IP and per-user counters. All three live behind
//! one lock, so the counters always match the session map.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Sessions older than this are reclaimed by the sweeper
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Above this many live sessions the sweeper resets everything
pub const HIGH_WATER_MARK: usize = 10_000;

/// A denied admission
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LimitExceeded {
    #[error("Too many connections from IP {ip} (limit {limit})")]
    Ip { ip: String, limit: u32 },

    #[error("Too many connections for user {username} (limit {limit})")]
    User { username: String, limit: u32 },
}

/// Snapshot of the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total_sessions: usize,
    #[serde(rename = "uniqueIPs")]
    pub unique_ips: usize,
    pub unique_users: usize,
}

#[derive(Debug)]
struct Session {
    client_ip: String,
    username: String,
    started: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    by_ip: HashMap<String, usize>,
    by_user: HashMap<String, usize>,
}

impl Inner {
    fn check(&self, ip: &str, username: &str, per_user_max: u32, per_ip_max: u32) -> Result<(), LimitExceeded> {
        if per_ip_max > 0 && self.by_ip.get(ip).copied().unwrap_or(0) >= per_ip_max as usize {
            return Err(LimitExceeded::Ip {
                ip: ip.to_string(),
                limit: per_ip_max,
            });
        }

        if per_user_max > 0
            && !username.is_empty()
            && self.by_user.get(username).copied().unwrap_or(0) >= per_user_max as usize
        {
            return Err(LimitExceeded::User {
                username: username.to_string(),
                limit: per_user_max,
            });
        }

        Ok(())
    }

    fn insert(&mut self, ip: &str, username: &str) -> String {
        let id = Uuid::new_v4().to_string();
        *self.by_ip.entry(ip.to_string()).or_insert(0) += 1;
        *self.by_user.entry(username.to_string()).or_insert(0) += 1;
        self.sessions.insert(
            id.clone(),
            Session {
                client_ip: ip.to_string(),
                username: username.to_string(),
                started: Instant::now(),
            },
        );
        id
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };
        decrement(&mut self.by_ip, &session.client_ip);
        decrement(&mut self.by_user, &session.username);
        true
    }
}

fn decrement(map: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = map.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// Session registry shared by every endpoint of one orchestrator
#[derive(Debug)]
pub struct ConnectionTracker {
    inner: Mutex<Inner>,
    session_timeout: Duration,
    high_water_mark: usize,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::with_limits(SESSION_TIMEOUT, HIGH_WATER_MARK)
    }

    pub fn with_limits(session_timeout: Duration, high_water_mark: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            session_timeout,
            high_water_mark,
        }
    }

    /// Would a new connection be allowed right now? 0 disables a limit.
    pub fn check_limits(
        &self,
        ip: &str,
        username: &str,
        per_user_max: u32,
        per_ip_max: u32,
    ) -> Result<(), LimitExceeded> {
        self.inner.lock().check(ip, username, per_user_max, per_ip_max)
    }

    /// Register a session without checking limits
    pub fn admit(&self, ip: &str, username: &str) -> String {
        self.inner.lock().insert(ip, username)
    }

    /// Check and register under one lock; the guard releases on drop
    pub fn try_admit(
        self: &Arc<Self>,
        ip: &str,
        username: &str,
        per_user_max: u32,
        per_ip_max: u32,
    ) -> Result<SessionGuard, LimitExceeded> {
        let id = {
            let mut inner = self.inner.lock();
            inner.check(ip, username, per_user_max, per_ip_max)?;
            inner.insert(ip, username)
        };

        Ok(SessionGuard {
            tracker: Arc::clone(self),
            id,
        })
    }

    /// Remove a session; unknown ids are ignored
    pub fn release(&self, session_id: &str) -> bool {
        self.inner.lock().remove(session_id)
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.inner.lock();
        ConnectionStats {
            total_sessions: inner.sessions.len(),
            unique_ips: inner.by_ip.len(),
            unique_users: inner.by_user.len(),
        }
    }

    pub fn ip_count(&self, ip: &str) -> usize {
        self.inner.lock().by_ip.get(ip).copied().unwrap_or(0)
    }

    pub fn user_count(&self, username: &str) -> usize {
        self.inner.lock().by_user.get(username).copied().unwrap_or(0)
    }

    /// Drop sessions past the timeout; returns how many were removed
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.started.elapsed() >= self.session_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            inner.remove(id);
        }

        let mut removed = expired.len();

        if inner.sessions.len() > self.high_water_mark {
            warn!(
                "{} live sessions exceed {}, resetting tracker",
                inner.sessions.len(),
                self.high_water_mark
            );
            removed += inner.sessions.len();
            *inner = Inner::default();
        }

        removed
    }

    /// Forget every session
    pub fn clear(&self) {
        *self.inner.lock() = Inner::default();
    }

    /// Run `sweep` every `interval` until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = tracker.sweep();
                        if removed > 0 {
                            debug!("Swept {} stale sessions", removed);
                        }
                    }
                }
            }
        })
    }
}

/// An admitted session; dropping it releases the session exactly once
#[derive(Debug)]
pub struct SessionGuard {
    tracker: Arc<ConnectionTracker>,
    id: String,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.id);
    }
}
