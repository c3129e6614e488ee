//! Per-job tick outcomes, read by the health surface.

use bharat_core::error::{CrmError, Result};
use bharat_core::types::JobRun;
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::{CrmDb, get_opt_ts, get_ts, ts};

impl CrmDb {
    /// Upsert the latest tick of `job_name`. `last_run_at` is only moved
    /// forward by ticks that actually ran the body.
    pub fn record_job_run(
        &self,
        job_name: &str,
        tick_at: DateTime<Utc>,
        outcome: &str,
        ran_at: Option<DateTime<Utc>>,
        error: Option<&str>,
        holder: Option<&str>,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO job_runs (job_name, last_tick_at, last_outcome, last_run_at, last_error, holder)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(job_name) DO UPDATE SET
                    last_tick_at = excluded.last_tick_at,
                    last_outcome = excluded.last_outcome,
                    last_run_at = coalesce(excluded.last_run_at, job_runs.last_run_at),
                    last_error = excluded.last_error,
                    holder = coalesce(excluded.holder, job_runs.holder)",
                params![job_name, ts(&tick_at), outcome, ran_at.as_ref().map(ts), error, holder],
            )
            .map_err(|e| CrmError::store(format!("Record job run: {e}")))?;
        Ok(())
    }

    pub fn list_job_runs(&self) -> Result<Vec<JobRun>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT job_name, last_tick_at, last_outcome, last_run_at, last_error, holder
                 FROM job_runs ORDER BY job_name",
            )
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let runs = stmt
            .query_map([], |row| {
                Ok(JobRun {
                    job_name: row.get(0)?,
                    last_tick_at: get_ts(row, 1)?,
                    last_outcome: row.get(2)?,
                    last_run_at: get_opt_ts(row, 3)?,
                    last_error: row.get(4)?,
                    holder: row.get(5)?,
                })
            })
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read job run: {e}")))?;
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use chrono::Duration;

    #[test]
    fn test_unran_tick_keeps_last_run() {
        let db = temp_db();
        db.record_job_run("campaigns", t0(), "ran", Some(t0()), None, Some("node-a"))
            .unwrap();
        // Lease store was down: the body never ran on this tick.
        let later = t0() + Duration::seconds(30);
        db.record_job_run("campaigns", later, "failed", None, Some("lease store down"), None)
            .unwrap();

        let runs = db.list_job_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].last_outcome, "failed");
        assert_eq!(runs[0].last_tick_at, later);
        assert_eq!(runs[0].last_run_at, Some(t0()));
        assert_eq!(runs[0].holder.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_failed_tick_records_error() {
        let db = temp_db();
        db.record_job_run("trial-expiry", t0(), "failed", Some(t0()), Some("db locked"), Some("n"))
            .unwrap();
        db.record_job_run("call-queue", t0(), "ran", Some(t0()), None, Some("n")).unwrap();
        let runs = db.list_job_runs().unwrap();
        assert_eq!(runs[0].job_name, "call-queue");
        assert_eq!(runs[1].last_error.as_deref(), Some("db locked"));
    }
}
