//! Distributed lock manager: short-lived, renewable, single-holder leases.
//!
//! A lease is a `key → (token, expires_at)` entry in a [`LeaseStore`].
//! Acquire is one atomic "set if absent or expired"; renew and release are
//! compare-and-swap on the holder token. Expiry needs no supervisor: once
//! `expires_at` has passed the next acquire simply overwrites the entry.

use async_trait::async_trait;
use bharat_core::error::{CrmError, Result};
use bharat_core::Clock;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Storage for leases. Implementations must make each operation atomic.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Set `key` to `token` if absent or expired at `now`. Returns whether
    /// the caller now holds it.
    async fn try_acquire(&self, key: &str, token: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>)
        -> Result<bool>;

    /// Extend the lease if `token` still holds it and it has not expired.
    async fn renew(&self, key: &str, token: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Delete the lease if `token` holds it.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;

    /// Current unexpired holder token.
    async fn holder(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>>;
}

// ─── SQLite ─────────────────────────────────────────────

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Lease table in a SQLite file shared by every worker on the host.
pub struct SqliteLeaseStore {
    conn: Mutex<Connection>,
}

impl SqliteLeaseStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| CrmError::Lease(format!("Lease DB open: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS leases (
                 key TEXT PRIMARY KEY,
                 token TEXT NOT NULL,
                 expires_at TEXT NOT NULL
             );",
        )
        .map_err(|e| CrmError::Lease(format!("Lease DB migration: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "INSERT INTO leases (key, token, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET token = excluded.token, expires_at = excluded.expires_at
                 WHERE leases.expires_at <= ?4",
                params![key, token, ts(&expires_at), ts(&now)],
            )
            .map_err(|e| CrmError::Lease(format!("Acquire {key}: {e}")))?;
        Ok(changed == 1)
    }

    async fn renew(&self, key: &str, token: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE leases SET expires_at = ?1 WHERE key = ?2 AND token = ?3 AND expires_at > ?4",
                params![ts(&expires_at), key, token, ts(&now)],
            )
            .map_err(|e| CrmError::Lease(format!("Renew {key}: {e}")))?;
        Ok(changed == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM leases WHERE key = ?1 AND token = ?2", params![key, token])
            .map_err(|e| CrmError::Lease(format!("Release {key}: {e}")))?;
        Ok(changed == 1)
    }

    async fn holder(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT token FROM leases WHERE key = ?1 AND expires_at > ?2",
                params![key, ts(&now)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CrmError::Lease(format!("Holder {key}: {e}")))
    }
}

// ─── In-memory ──────────────────────────────────────────

/// Single-process lease store.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, DateTime<Utc>)>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut leases = self.leases();
        match leases.get(key) {
            Some((_, exp)) if *exp > now => Ok(false),
            _ => {
                leases.insert(key.to_string(), (token.to_string(), expires_at));
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &str, token: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<bool> {
        let mut leases = self.leases();
        match leases.get_mut(key) {
            Some((held, exp)) if held == token && *exp > now => {
                *exp = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut leases = self.leases();
        if leases.get(key).is_some_and(|(held, _)| held == token) {
            leases.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn holder(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self
            .leases()
            .get(key)
            .filter(|(_, exp)| *exp > now)
            .map(|(token, _)| token.clone()))
    }
}

// ─── Manager ────────────────────────────────────────────

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    Renewed(DateTime<Utc>),
    /// Expired or taken over; the holder must stop.
    Lost,
}

/// Lease key for a scheduled job.
pub fn lock_key_for(job_name: &str) -> String {
    format!("job:{job_name}")
}

/// Acquires, renews and releases leases against a [`LeaseStore`], reading
/// time from the injected clock.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| CrmError::Config(format!("lease ttl: {e}")))?;
        Ok(now + ttl)
    }

    /// Try to take `key` for `ttl`. `None` means another holder has it.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl)?;
        let token = uuid::Uuid::new_v4().to_string();
        if self.store.try_acquire(key, &token, now, expires_at).await? {
            tracing::debug!("🔒 Lease acquired: {key} until {expires_at}");
            Ok(Some(LeaseToken {
                key: key.to_string(),
                token,
                expires_at,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn renew(&self, lease: &LeaseToken, ttl: Duration) -> Result<Renewal> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl)?;
        if self.store.renew(&lease.key, &lease.token, now, expires_at).await? {
            Ok(Renewal::Renewed(expires_at))
        } else {
            tracing::warn!("⚠️ Lease lost: {}", lease.key);
            Ok(Renewal::Lost)
        }
    }

    /// Release `lease`. A lease that already expired or changed hands is
    /// left alone.
    pub async fn release(&self, lease: &LeaseToken) -> Result<()> {
        if self.store.release(&lease.key, &lease.token).await? {
            tracing::debug!("🔓 Lease released: {}", lease.key);
        } else {
            tracing::debug!("🔓 Lease {} was no longer ours at release", lease.key);
        }
        Ok(())
    }

    /// Whether any unexpired lease exists on `key`.
    pub async fn is_held(&self, key: &str) -> Result<bool> {
        Ok(self.store.holder(key, self.clock.now()).await?.is_some())
    }

    /// Whether `lease` is still the live holder of its key.
    pub async fn still_holds(&self, lease: &LeaseToken) -> Result<bool> {
        let holder = self.store.holder(&lease.key, self.clock.now()).await?;
        Ok(holder.as_deref() == Some(lease.token.as_str()))
    }
}
