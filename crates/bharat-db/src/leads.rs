//! Leads and their follow-up reminder bookkeeping.

use bharat_core::error::{CrmError, Result};
use bharat_core::types::Lead;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::{CrmDb, get_opt_ts, new_id, ts};

const LEAD_SELECT: &str = "SELECT id, tenant_id, name, owner_contact, next_follow_up_at, reminder_sent_for, last_reminder_error, last_reminder_attempt_at FROM leads";

fn row_to_lead(row: &rusqlite::Row) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        owner_contact: row.get(3)?,
        next_follow_up_at: get_opt_ts(row, 4)?,
        reminder_sent_for: get_opt_ts(row, 5)?,
        last_reminder_error: row.get(6)?,
        last_reminder_attempt_at: get_opt_ts(row, 7)?,
    })
}

impl CrmDb {
    pub fn create_lead(
        &self,
        tenant_id: &str,
        name: &str,
        owner_contact: &str,
        next_follow_up_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Lead> {
        let id = new_id();
        self.conn()
            .execute(
                "INSERT INTO leads (id, tenant_id, name, owner_contact, next_follow_up_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, tenant_id, name, owner_contact, next_follow_up_at.as_ref().map(ts), ts(&now)],
            )
            .map_err(|e| CrmError::store(format!("Insert lead: {e}")))?;
        self.get_lead(&id)
    }

    pub fn get_lead(&self, id: &str) -> Result<Lead> {
        self.conn()
            .query_row(&format!("{LEAD_SELECT} WHERE id = ?1"), params![id], row_to_lead)
            .optional()
            .map_err(|e| CrmError::store(format!("Get lead: {e}")))?
            .ok_or_else(|| CrmError::NotFound(format!("lead {id}")))
    }

    /// Leads whose follow-up time has arrived and that have not had a
    /// reminder for that exact follow-up time. Leads never attempted come
    /// first; failed ones follow, least recently tried first, so a few
    /// persistently failing leads cannot occupy every batch.
    pub fn due_reminders(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Lead>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{LEAD_SELECT}
                 WHERE next_follow_up_at IS NOT NULL AND next_follow_up_at <= ?1
                 AND (reminder_sent_for IS NULL OR reminder_sent_for != next_follow_up_at)
                 ORDER BY last_reminder_attempt_at IS NOT NULL, last_reminder_attempt_at,
                          next_follow_up_at, id
                 LIMIT ?2"
            ))
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let leads = stmt
            .query_map(params![ts(&now), limit as i64], row_to_lead)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read lead: {e}")))?;
        Ok(leads)
    }

    /// Mark the reminder for `follow_up_at` as issued. Conditional on the
    /// follow-up still being that value, so a reschedule in between keeps
    /// the lead eligible.
    pub fn stamp_reminder(&self, id: &str, follow_up_at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE leads SET reminder_sent_for = ?1, last_reminder_error = NULL,
                    last_reminder_attempt_at = NULL
                 WHERE id = ?2 AND next_follow_up_at = ?1",
                params![ts(&follow_up_at), id],
            )
            .map_err(|e| CrmError::store(format!("Stamp reminder: {e}")))?;
        Ok(changed == 1)
    }

    pub fn record_reminder_error(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE leads SET last_reminder_error = ?1, last_reminder_attempt_at = ?2 WHERE id = ?3",
                params![error, ts(&at), id],
            )
            .map_err(|e| CrmError::store(format!("Record reminder error: {e}")))?;
        Ok(())
    }

    /// Reschedule (or clear) a lead's follow-up.
    pub fn set_follow_up(&self, id: &str, next_follow_up_at: Option<DateTime<Utc>>) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE leads SET next_follow_up_at = ?1 WHERE id = ?2",
                params![next_follow_up_at.as_ref().map(ts), id],
            )
            .map_err(|e| CrmError::store(format!("Set follow-up: {e}")))?;
        Ok(())
    }
}
