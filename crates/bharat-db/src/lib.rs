//! # Bharat DB
//!
//! SQLite record store: the single source of truth for every worker
//! replica. All state transitions are expressed as conditional updates
//! keyed on the expected prior value; nothing is read-modify-written in two
//! steps.
//!
//! Timestamps are stored as fixed-precision RFC 3339 UTC strings, so
//! lexical comparison in SQL equals chronological comparison.

mod calls;
mod campaigns;
mod conversations;
mod leads;
mod runs;
mod tenants;

pub use calls::{CallTransition, NewCall};
pub use campaigns::RecipientCounts;
pub use conversations::{MergeOutcome, NewThread};

use bharat_core::error::{CrmError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Shared record store.
pub struct CrmDb {
    conn: Mutex<Connection>,
}

impl CrmDb {
    /// Open or create the record store. `":memory:"` gives a private
    /// in-memory database (tests).
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| CrmError::store(format!("DB open error: {e}")))?;

        // WAL lets several worker processes share the file; busy_timeout
        // turns brief writer contention into waiting instead of errors.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| CrmError::store(format!("DB pragma error: {e}")))?;

        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                plan TEXT NOT NULL DEFAULT 'trial',
                status TEXT NOT NULL DEFAULT 'active',
                subscription_end TEXT,
                default_country TEXT,
                suspended_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tenants_trial
                ON tenants(plan, status, subscription_end);

            CREATE TABLE IF NOT EXISTS conversation_threads (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                owner_user_id TEXT,
                raw_phone TEXT NOT NULL,
                canonical_phone TEXT NOT NULL,
                country_code TEXT,
                phone_normalized INTEGER NOT NULL DEFAULT 0,
                last_message_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_threads_tenant_phone
                ON conversation_threads(tenant_id, canonical_phone);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES conversation_threads(id) ON DELETE CASCADE,
                external_message_id TEXT,
                direction TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_thread_external
                ON messages(thread_id, external_message_id)
                WHERE external_message_id IS NOT NULL;

            -- Messages that could not be re-parented; reviewed by an operator
            CREATE TABLE IF NOT EXISTS merge_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                survivor_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                channel TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                scheduled_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS campaign_recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                recipient TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                sent_at TEXT,
                UNIQUE(campaign_id, recipient)
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_pending
                ON campaign_recipients(campaign_id, status, id);

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                owner_contact TEXT NOT NULL,
                next_follow_up_at TEXT,
                reminder_sent_for TEXT,
                last_reminder_error TEXT,
                last_reminder_attempt_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_follow_up ON leads(next_follow_up_at);

            CREATE TABLE IF NOT EXISTS call_work_items (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                target_phone TEXT NOT NULL,
                script TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 5,
                scheduled_for TEXT NOT NULL,
                last_error TEXT,
                transcript TEXT,
                started_at TEXT,
                completed_at TEXT,
                archived_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_calls_due
                ON call_work_items(status, priority, scheduled_for);

            CREATE TABLE IF NOT EXISTS job_runs (
                job_name TEXT PRIMARY KEY,
                last_tick_at TEXT NOT NULL,
                last_outcome TEXT NOT NULL,
                last_run_at TEXT,
                last_error TEXT,
                holder TEXT
            );

            CREATE TABLE IF NOT EXISTS dedup_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trigger TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                threads_examined INTEGER NOT NULL DEFAULT 0,
                canonical_backfilled INTEGER NOT NULL DEFAULT 0,
                duplicate_groups INTEGER NOT NULL DEFAULT 0,
                duplicates_found INTEGER NOT NULL DEFAULT 0,
                messages_moved INTEGER NOT NULL DEFAULT 0,
                messages_skipped INTEGER NOT NULL DEFAULT 0,
                threads_deleted INTEGER NOT NULL DEFAULT 0,
                groups_failed INTEGER NOT NULL DEFAULT 0
            );
         ",
            )
            .map_err(|e| CrmError::store(format!("Migration: {e}")))?;
        Ok(())
    }

    /// Lock the connection. A poisoned lock only means another thread
    /// panicked mid-call; SQLite itself is still consistent.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Format a timestamp for storage.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn get_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(idx, &s)
}

pub(crate) fn get_opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(idx, &s)).transpose()
}

/// Parse a stored enum column via `FromStr`.
pub(crate) fn get_enum<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = CrmError>,
{
    let s: String = row.get(idx)?;
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_open_and_migrate_twice() {
        let db = temp_db();
        db.migrate().unwrap();
        assert!(db.list_tenants().unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_format_sorts_lexically() {
        let a = ts(&t0());
        let b = ts(&(t0() + chrono::Duration::milliseconds(5)));
        assert!(a < b);
        assert_eq!(a, "2026-03-01T09:00:00.000Z");
        assert_eq!(parse_ts(0, &a).unwrap(), t0());
    }
}
