//! Campaigns and their per-recipient send ledger.

use bharat_core::error::{CrmError, Result};
use bharat_core::types::{Campaign, CampaignRecipient, CampaignStatus, RecipientStatus};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::{CrmDb, get_enum, get_opt_ts, get_ts, new_id, ts};

const CAMPAIGN_SELECT: &str =
    "SELECT id, tenant_id, name, channel, payload, status, scheduled_at, completed_at FROM campaigns";

fn row_to_campaign(row: &rusqlite::Row) -> rusqlite::Result<Campaign> {
    Ok(Campaign {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        channel: row.get(3)?,
        payload: row.get(4)?,
        status: get_enum::<CampaignStatus>(row, 5)?,
        scheduled_at: get_ts(row, 6)?,
        completed_at: get_opt_ts(row, 7)?,
    })
}

fn row_to_recipient(row: &rusqlite::Row) -> rusqlite::Result<CampaignRecipient> {
    Ok(CampaignRecipient {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        recipient: row.get(2)?,
        status: get_enum::<RecipientStatus>(row, 3)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        sent_at: get_opt_ts(row, 6)?,
    })
}

/// Per-status recipient totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecipientCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

impl CrmDb {
    // ── Campaigns ────────────────────────────────────

    /// Schedule a campaign.
    pub fn create_campaign(
        &self,
        tenant_id: &str,
        name: &str,
        channel: &str,
        payload: &str,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Campaign> {
        let id = new_id();
        self.conn()
            .execute(
                "INSERT INTO campaigns (id, tenant_id, name, channel, payload, status, scheduled_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'scheduled', ?6, ?7)",
                params![id, tenant_id, name, channel, payload, ts(&scheduled_at), ts(&now)],
            )
            .map_err(|e| CrmError::store(format!("Insert campaign: {e}")))?;
        self.get_campaign(&id)
    }

    pub fn get_campaign(&self, id: &str) -> Result<Campaign> {
        self.conn()
            .query_row(&format!("{CAMPAIGN_SELECT} WHERE id = ?1"), params![id], row_to_campaign)
            .optional()
            .map_err(|e| CrmError::store(format!("Get campaign: {e}")))?
            .ok_or_else(|| CrmError::NotFound(format!("campaign {id}")))
    }

    /// Campaigns to work on now: scheduled ones whose time has come plus
    /// running ones a previous holder did not finish.
    pub fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{CAMPAIGN_SELECT}
                 WHERE (status = 'scheduled' AND scheduled_at <= ?1) OR status = 'running'
                 ORDER BY scheduled_at, id"
            ))
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let campaigns = stmt
            .query_map(params![ts(&now)], row_to_campaign)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read campaign: {e}")))?;
        Ok(campaigns)
    }

    /// Move a campaign from `from` to `to`. Returns false when the row was
    /// not in `from` (cancelled or finished by someone else).
    pub fn set_campaign_status(
        &self,
        id: &str,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE campaigns SET status = ?1,
                    started_at = CASE WHEN ?1 = 'running' THEN coalesce(started_at, ?2) ELSE started_at END,
                    completed_at = CASE WHEN ?1 = 'completed' THEN ?2 ELSE completed_at END
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), ts(&now), id, from.as_str()],
            )
            .map_err(|e| CrmError::store(format!("Update campaign: {e}")))?;
        Ok(changed == 1)
    }

    // ── Recipients ────────────────────────────────────

    /// Add recipients; already-present addresses are ignored.
    pub fn add_recipients(&self, campaign_id: &str, recipients: &[&str]) -> Result<u64> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| CrmError::store(format!("Begin: {e}")))?;
        let mut added = 0u64;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO campaign_recipients (campaign_id, recipient, status)
                     VALUES (?1, ?2, 'pending')",
                )
                .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
            for r in recipients {
                added += stmt
                    .execute(params![campaign_id, r])
                    .map_err(|e| CrmError::store(format!("Insert recipient: {e}")))? as u64;
            }
        }
        tx.commit().map_err(|e| CrmError::store(format!("Commit: {e}")))?;
        Ok(added)
    }

    /// Next pending recipients in insertion order.
    pub fn pending_recipients(&self, campaign_id: &str, limit: u64) -> Result<Vec<CampaignRecipient>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, campaign_id, recipient, status, attempts, last_error, sent_at
                 FROM campaign_recipients
                 WHERE campaign_id = ?1 AND status = 'pending'
                 ORDER BY id LIMIT ?2",
            )
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![campaign_id, limit as i64], row_to_recipient)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read recipient: {e}")))?;
        Ok(rows)
    }

    /// Record a send result. Only a pending row changes, so a recipient is
    /// marked at most once.
    pub fn mark_recipient(
        &self,
        id: i64,
        status: RecipientStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sent_at = (status == RecipientStatus::Sent).then(|| ts(&now));
        let changed = self
            .conn()
            .execute(
                "UPDATE campaign_recipients
                 SET status = ?1, attempts = attempts + 1, last_error = ?2, sent_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![status.as_str(), error, sent_at, id],
            )
            .map_err(|e| CrmError::store(format!("Mark recipient: {e}")))?;
        Ok(changed == 1)
    }

    pub fn recipient_counts(&self, campaign_id: &str) -> Result<RecipientCounts> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT status, count(*) FROM campaign_recipients WHERE campaign_id = ?1 GROUP BY status")
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![campaign_id], |row| {
                Ok((get_enum::<RecipientStatus>(row, 0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(|e| CrmError::store(format!("Query: {e}")))?;

        let mut counts = RecipientCounts::default();
        for row in rows {
            let (status, n) = row.map_err(|e| CrmError::store(format!("Read count: {e}")))?;
            match status {
                RecipientStatus::Pending => counts.pending = n,
                RecipientStatus::Sent => counts.sent = n,
                RecipientStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    pub fn list_recipients(&self, campaign_id: &str) -> Result<Vec<CampaignRecipient>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, campaign_id, recipient, status, attempts, last_error, sent_at
                 FROM campaign_recipients WHERE campaign_id = ?1 ORDER BY id",
            )
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![campaign_id], row_to_recipient)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read recipient: {e}")))?;
        Ok(rows)
    }
}
