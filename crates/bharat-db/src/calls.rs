//! Call work item persistence. Legality of a transition is checked by the
//! call queue before it reaches [`CrmDb::transition_call`]; this layer only
//! guarantees the update applies to the state the caller observed.

use bharat_core::error::{CrmError, Result};
use bharat_core::types::{CallStatus, CallWorkItem};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::{CrmDb, get_enum, get_opt_ts, get_ts, new_id, ts};

/// Fields for enqueueing a call.
#[derive(Debug, Clone)]
pub struct NewCall<'a> {
    pub tenant_id: &'a str,
    pub target_phone: &'a str,
    pub script: &'a str,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
}

/// One conditional status change.
#[derive(Debug, Clone)]
pub struct CallTransition<'a> {
    pub id: &'a str,
    pub from: CallStatus,
    pub to: CallStatus,
    pub at: DateTime<Utc>,
    /// Count a dispatch attempt (leaving `in_progress`).
    pub increment_attempts: bool,
    /// `Some` overwrites `last_error`; `None` keeps it.
    pub last_error: Option<&'a str>,
    pub transcript: Option<&'a str>,
    /// New `scheduled_for` (retry with backoff).
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Guard for `failed -> queued`: applied only while attempts are below it.
    pub max_attempts: Option<u32>,
}

impl<'a> CallTransition<'a> {
    pub fn new(id: &'a str, from: CallStatus, to: CallStatus, at: DateTime<Utc>) -> Self {
        Self {
            id,
            from,
            to,
            at,
            increment_attempts: false,
            last_error: None,
            transcript: None,
            scheduled_for: None,
            max_attempts: None,
        }
    }
}

const CALL_SELECT: &str = "SELECT id, tenant_id, target_phone, script, status, attempts, priority, scheduled_for, last_error, transcript, started_at, completed_at, archived_at, created_at, updated_at FROM call_work_items";

fn row_to_call(row: &rusqlite::Row) -> rusqlite::Result<CallWorkItem> {
    Ok(CallWorkItem {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        target_phone: row.get(2)?,
        script: row.get(3)?,
        status: get_enum::<CallStatus>(row, 4)?,
        attempts: row.get(5)?,
        priority: row.get(6)?,
        scheduled_for: get_ts(row, 7)?,
        last_error: row.get(8)?,
        transcript: row.get(9)?,
        started_at: get_opt_ts(row, 10)?,
        completed_at: get_opt_ts(row, 11)?,
        archived_at: get_opt_ts(row, 12)?,
        created_at: get_ts(row, 13)?,
        updated_at: get_ts(row, 14)?,
    })
}

impl CrmDb {
    /// Insert a queued call.
    pub fn enqueue_call(&self, new: &NewCall<'_>, now: DateTime<Utc>) -> Result<CallWorkItem> {
        let id = new_id();
        self.conn()
            .execute(
                "INSERT INTO call_work_items
                 (id, tenant_id, target_phone, script, status, attempts, priority, scheduled_for, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?7, ?7)",
                params![id, new.tenant_id, new.target_phone, new.script, new.priority, ts(&new.scheduled_for), ts(&now)],
            )
            .map_err(|e| CrmError::store(format!("Enqueue call: {e}")))?;
        self.get_call(&id)
    }

    pub fn get_call(&self, id: &str) -> Result<CallWorkItem> {
        self.conn()
            .query_row(&format!("{CALL_SELECT} WHERE id = ?1"), params![id], row_to_call)
            .optional()
            .map_err(|e| CrmError::store(format!("Get call: {e}")))?
            .ok_or_else(|| CrmError::NotFound(format!("call {id}")))
    }

    /// Calls for operators, newest first. Archived items are hidden unless
    /// asked for.
    pub fn list_calls(
        &self,
        tenant_id: Option<&str>,
        status: Option<CallStatus>,
        include_archived: bool,
    ) -> Result<Vec<CallWorkItem>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{CALL_SELECT}
                 WHERE (?1 IS NULL OR tenant_id = ?1)
                 AND (?2 IS NULL OR status = ?2)
                 AND (?3 OR archived_at IS NULL)
                 ORDER BY created_at DESC, id"
            ))
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let calls = stmt
            .query_map(
                params![tenant_id, status.map(|s| s.as_str()), include_archived],
                row_to_call,
            )
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read call: {e}")))?;
        Ok(calls)
    }

    /// Queued calls whose time has come, most urgent first.
    pub fn due_calls(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<CallWorkItem>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{CALL_SELECT}
                 WHERE status = 'queued' AND scheduled_for <= ?1 AND archived_at IS NULL
                 ORDER BY priority ASC, scheduled_for ASC, id
                 LIMIT ?2"
            ))
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let calls = stmt
            .query_map(params![ts(&now), limit as i64], row_to_call)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read call: {e}")))?;
        Ok(calls)
    }

    /// Apply a transition as one `UPDATE … WHERE id = ? AND status = ?from`.
    /// Returns false when the row was no longer in `from`.
    pub fn transition_call(&self, t: &CallTransition<'_>) -> Result<bool> {
        let at = ts(&t.at);
        let changed = self
            .conn()
            .execute(
                "UPDATE call_work_items SET
                    status = ?1,
                    attempts = attempts + ?2,
                    last_error = coalesce(?3, last_error),
                    transcript = coalesce(?4, transcript),
                    scheduled_for = coalesce(?5, scheduled_for),
                    started_at = CASE WHEN ?1 = 'in_progress' THEN ?6 ELSE started_at END,
                    completed_at = CASE
                        WHEN ?1 IN ('completed', 'failed', 'cancelled') THEN ?6
                        WHEN ?1 = 'queued' THEN NULL
                        ELSE completed_at END,
                    updated_at = ?6
                 WHERE id = ?7 AND status = ?8
                 AND (?9 IS NULL OR attempts < ?9)",
                params![
                    t.to.as_str(),
                    t.increment_attempts as i64,
                    t.last_error,
                    t.transcript,
                    t.scheduled_for.as_ref().map(ts),
                    at,
                    t.id,
                    t.from.as_str(),
                    t.max_attempts,
                ],
            )
            .map_err(|e| CrmError::store(format!("Transition call: {e}")))?;
        Ok(changed == 1)
    }

    /// Calls stuck `in_progress` since before `cutoff`.
    pub fn stale_in_progress(&self, cutoff: DateTime<Utc>) -> Result<Vec<CallWorkItem>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{CALL_SELECT} WHERE status = 'in_progress' AND started_at IS NOT NULL AND started_at < ?1
                 ORDER BY started_at, id"
            ))
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let calls = stmt
            .query_map(params![ts(&cutoff)], row_to_call)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read call: {e}")))?;
        Ok(calls)
    }

    /// Archive finished calls (completed or cancelled) that ended before
    /// `cutoff`. Rows are kept; returns how many were archived.
    pub fn archive_calls(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let changed = self
            .conn()
            .execute(
                "UPDATE call_work_items SET archived_at = ?1
                 WHERE archived_at IS NULL
                 AND status IN ('completed', 'cancelled')
                 AND completed_at IS NOT NULL AND completed_at < ?2",
                params![ts(&now), ts(&cutoff)],
            )
            .map_err(|e| CrmError::store(format!("Archive calls: {e}")))?;
        Ok(changed as u64)
    }
}
