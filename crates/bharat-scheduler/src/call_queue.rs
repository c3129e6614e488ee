//! Call queue state machine.
//!
//! ```text
//!            ┌──────────── cancel ─────────────┐
//!            │                                 ▼
//!  queued ──start──▶ in_progress ──▶ completed | failed | cancelled
//!    ▲                                           │
//!    └────── retry (attempts < max_attempts) ────┘ failed
//! ```
//!
//! `failed → queued` is the only backward edge. Operators may cancel a
//! queued or failed item. Every transition is validated here, then applied
//! as one conditional update on the expected prior status.

use bharat_core::config::CallQueueConfig;
use bharat_core::error::{CrmError, Result};
use bharat_core::types::{CallStatus, CallWorkItem};
use bharat_core::Clock;
use bharat_db::{CallTransition, CrmDb, NewCall};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Error recorded on items recovered from a dead worker.
pub const INTERRUPTED: &str = "interrupted";

/// Whether `from → to` is an edge of the lifecycle graph.
pub fn check_transition(from: CallStatus, to: CallStatus) -> bool {
    use CallStatus::*;
    matches!(
        (from, to),
        (Queued, InProgress)
            | (Queued, Cancelled)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Cancelled)
            | (Failed, Queued)
            | (Failed, Cancelled)
    )
}

fn invalid(id: &str, from: CallStatus, to: CallStatus) -> CrmError {
    CrmError::InvalidTransition {
        entity: "call",
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Counters from one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallPassStats {
    pub recovered: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub requeued: u64,
}

/// Call queue operations over the record store.
#[derive(Clone)]
pub struct CallQueue {
    db: Arc<CrmDb>,
    clock: Arc<dyn Clock>,
    policy: CallQueueConfig,
}

impl CallQueue {
    pub fn new(db: Arc<CrmDb>, clock: Arc<dyn Clock>, policy: CallQueueConfig) -> Self {
        Self { db, clock, policy }
    }

    pub fn policy(&self) -> &CallQueueConfig {
        &self.policy
    }

    /// Queue a call. `scheduled_for` defaults to now.
    pub fn enqueue(
        &self,
        tenant_id: &str,
        target_phone: &str,
        script: &str,
        priority: i32,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<CallWorkItem> {
        let now = self.clock.now();
        let item = self.db.enqueue_call(
            &NewCall {
                tenant_id,
                target_phone,
                script,
                priority,
                scheduled_for: scheduled_for.unwrap_or(now),
            },
            now,
        )?;
        tracing::info!("📞 Call {} queued for {} (priority {})", item.id, item.target_phone, item.priority);
        Ok(item)
    }

    pub fn get(&self, id: &str) -> Result<CallWorkItem> {
        self.db.get_call(id)
    }

    pub fn list(&self, tenant_id: Option<&str>, status: Option<CallStatus>) -> Result<Vec<CallWorkItem>> {
        self.db.list_calls(tenant_id, status, false)
    }

    /// Validate then apply. `Conflict` when the row moved on meanwhile.
    fn apply(&self, t: CallTransition<'_>) -> Result<()> {
        if !check_transition(t.from, t.to) {
            return Err(invalid(t.id, t.from, t.to));
        }
        if self.db.transition_call(&t)? {
            Ok(())
        } else {
            Err(CrmError::Conflict(format!("call {} is no longer {}", t.id, t.from)))
        }
    }

    /// Operator retry of a failed item.
    pub fn retry(&self, id: &str) -> Result<CallWorkItem> {
        let item = self.db.get_call(id)?;
        if item.status != CallStatus::Failed {
            return Err(invalid(id, item.status, CallStatus::Queued));
        }
        if item.attempts >= self.policy.max_attempts {
            return Err(CrmError::Conflict(format!(
                "call {id} used {}/{} attempts",
                item.attempts, self.policy.max_attempts
            )));
        }
        let now = self.clock.now();
        self.apply(CallTransition {
            scheduled_for: Some(now),
            max_attempts: Some(self.policy.max_attempts),
            ..CallTransition::new(id, CallStatus::Failed, CallStatus::Queued, now)
        })?;
        tracing::info!("🔁 Call {id} re-queued by operator");
        self.db.get_call(id)
    }

    /// Operator cancel of a queued or failed item.
    pub fn cancel(&self, id: &str) -> Result<CallWorkItem> {
        let item = self.db.get_call(id)?;
        if !matches!(item.status, CallStatus::Queued | CallStatus::Failed) {
            return Err(invalid(id, item.status, CallStatus::Cancelled));
        }
        self.apply(CallTransition::new(id, item.status, CallStatus::Cancelled, self.clock.now()))?;
        tracing::info!("🚫 Call {id} cancelled");
        self.db.get_call(id)
    }

    /// Queued items whose time has come, most urgent first.
    pub fn due(&self, limit: u64) -> Result<Vec<CallWorkItem>> {
        self.db.due_calls(self.clock.now(), limit)
    }

    /// Claim a queued item. Returns false when another worker got it first.
    pub fn start(&self, item: &CallWorkItem) -> Result<bool> {
        match self.apply(CallTransition::new(&item.id, CallStatus::Queued, CallStatus::InProgress, self.clock.now())) {
            Ok(()) => Ok(true),
            Err(CrmError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn complete(&self, item: &CallWorkItem, transcript: Option<&str>) -> Result<()> {
        self.apply(CallTransition {
            increment_attempts: true,
            transcript,
            ..CallTransition::new(&item.id, CallStatus::InProgress, CallStatus::Completed, self.clock.now())
        })
    }

    /// Record a failed attempt. Re-queues with backoff while attempts
    /// remain; returns whether it did.
    pub fn fail(&self, item: &CallWorkItem, error: &str) -> Result<bool> {
        let now = self.clock.now();
        self.apply(CallTransition {
            increment_attempts: true,
            last_error: Some(error),
            ..CallTransition::new(&item.id, CallStatus::InProgress, CallStatus::Failed, now)
        })?;
        self.requeue_with_backoff(&item.id, item.attempts + 1, now)
    }

    fn requeue_with_backoff(&self, id: &str, attempts: u32, now: DateTime<Utc>) -> Result<bool> {
        if attempts >= self.policy.max_attempts {
            tracing::warn!("⚠️ Call {id} failed for good after {attempts} attempt(s)");
            return Ok(false);
        }
        let retry_at = now + Duration::seconds(self.policy.retry_backoff_secs as i64);
        let requeued = self.db.transition_call(&CallTransition {
            scheduled_for: Some(retry_at),
            max_attempts: Some(self.policy.max_attempts),
            ..CallTransition::new(id, CallStatus::Failed, CallStatus::Queued, now)
        })?;
        if requeued {
            tracing::info!("🔁 Call {id} retry {attempts}/{} at {retry_at}", self.policy.max_attempts);
        }
        Ok(requeued)
    }

    /// Fail items left `in_progress` by a worker that died mid-call.
    pub fn recover_stale(&self) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = now - Duration::seconds(self.policy.stale_after_secs as i64);
        let mut recovered = 0;
        for item in self.db.stale_in_progress(cutoff)? {
            let moved = self.db.transition_call(&CallTransition {
                increment_attempts: true,
                last_error: Some(INTERRUPTED),
                ..CallTransition::new(&item.id, CallStatus::InProgress, CallStatus::Failed, now)
            })?;
            if moved {
                tracing::warn!("⚠️ Call {} interrupted (in progress since {:?})", item.id, item.started_at);
                recovered += 1;
                self.requeue_with_backoff(&item.id, item.attempts + 1, now)?;
            }
        }
        Ok(recovered)
    }

    /// Archive completed and cancelled items older than the retention window.
    pub fn cleanup(&self) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = now - Duration::days(self.policy.retention_days as i64);
        let archived = self.db.archive_calls(cutoff, now)?;
        if archived > 0 {
            tracing::info!("🗄️ Archived {archived} finished call(s) older than {} days", self.policy.retention_days);
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bharat_core::ManualClock;
    use chrono::TimeZone;
    use std::path::Path;

    fn setup(max_attempts: u32) -> (CallQueue, ManualClock) {
        let db = Arc::new(CrmDb::open(Path::new(":memory:")).unwrap());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let policy = CallQueueConfig {
            max_attempts,
            retry_backoff_secs: 300,
            stale_after_secs: 900,
            retention_days: 30,
            batch_limit: 10,
        };
        (CallQueue::new(db, Arc::new(clock.clone()), policy), clock)
    }

    #[test]
    fn test_edge_set() {
        use CallStatus::*;
        let legal = [
            (Queued, InProgress),
            (Queued, Cancelled),
            (InProgress, Completed),
            (InProgress, Failed),
            (InProgress, Cancelled),
            (Failed, Queued),
            (Failed, Cancelled),
        ];
        for from in CallStatus::ALL {
            for to in CallStatus::ALL {
                assert_eq!(check_transition(from, to), legal.contains(&(from, to)), "{from} -> {to}");
            }
        }
        // No edge leaves a terminal state.
        for terminal in [Completed, Cancelled] {
            assert!(CallStatus::ALL.iter().all(|to| !check_transition(terminal, *to)));
        }
    }

    #[test]
    fn test_happy_path() {
        let (q, _) = setup(3);
        let item = q.enqueue("t1", "+919876543210", "Renewal reminder", 1, None).unwrap();
        assert!(q.start(&item).unwrap());
        assert!(!q.start(&item).unwrap());
        q.complete(&item, Some("will renew")).unwrap();

        let done = q.get(&item.id).unwrap();
        assert_eq!(done.status, CallStatus::Completed);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.transcript.as_deref(), Some("will renew"));

        let err = q.cancel(&item.id).unwrap_err();
        assert!(matches!(err, CrmError::InvalidTransition { .. }));
    }

    #[test]
    fn test_failure_requeues_until_cap() {
        let (q, clock) = setup(2);
        let item = q.enqueue("t1", "+919876543210", "s", 1, None).unwrap();

        assert!(q.start(&item).unwrap());
        assert!(q.fail(&item, "no answer").unwrap());
        let row = q.get(&item.id).unwrap();
        assert_eq!(row.status, CallStatus::Queued);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("no answer"));
        assert!(q.due(10).unwrap().is_empty(), "backoff not elapsed");

        clock.advance(Duration::seconds(300));
        let row = q.due(10).unwrap().remove(0);
        assert!(q.start(&row).unwrap());
        assert!(!q.fail(&row, "busy").unwrap());
        let row = q.get(&item.id).unwrap();
        assert_eq!(row.status, CallStatus::Failed);
        assert_eq!(row.attempts, 2);

        // Attempts exhausted: operator retry refused.
        assert!(matches!(q.retry(&item.id), Err(CrmError::Conflict(_))));
        q.cancel(&item.id).unwrap();
        assert_eq!(q.get(&item.id).unwrap().status, CallStatus::Cancelled);
    }

    #[test]
    fn test_operator_retry() {
        let (q, _) = setup(1);
        let item = q.enqueue("t1", "+14155552671", "s", 5, None).unwrap();
        assert!(matches!(q.retry(&item.id), Err(CrmError::InvalidTransition { .. })));
        q.start(&item).unwrap();
        assert!(!q.fail(&item, "rejected").unwrap());
        // max_attempts = 1 and one attempt used.
        assert!(q.retry(&item.id).is_err());

        let (q, _) = setup(3);
        let item = q.enqueue("t1", "+14155552671", "s", 5, None).unwrap();
        q.start(&item).unwrap();
        q.apply(CallTransition {
            increment_attempts: true,
            last_error: Some("carrier down"),
            ..CallTransition::new(&item.id, CallStatus::InProgress, CallStatus::Failed, q.clock.now())
        })
        .unwrap();
        let retried = q.retry(&item.id).unwrap();
        assert_eq!(retried.status, CallStatus::Queued);
        assert!(retried.completed_at.is_none());
    }

    #[test]
    fn test_illegal_transition_writes_nothing() {
        let (q, _) = setup(3);
        let item = q.enqueue("t1", "+919876543210", "s", 1, None).unwrap();
        let err = q
            .apply(CallTransition::new(&item.id, CallStatus::Queued, CallStatus::Completed, q.clock.now()))
            .unwrap_err();
        assert!(matches!(err, CrmError::InvalidTransition { .. }));
        assert_eq!(q.get(&item.id).unwrap().status, CallStatus::Queued);
    }

    #[test]
    fn test_stale_recovery_and_cleanup() {
        let (q, clock) = setup(3);
        let item = q.enqueue("t1", "+919876543210", "s", 1, None).unwrap();
        q.start(&item).unwrap();

        clock.advance(Duration::minutes(10));
        assert_eq!(q.recover_stale().unwrap(), 0);
        clock.advance(Duration::minutes(6));
        assert_eq!(q.recover_stale().unwrap(), 1);
        let row = q.get(&item.id).unwrap();
        assert_eq!(row.status, CallStatus::Queued);
        assert_eq!(row.last_error.as_deref(), Some(INTERRUPTED));
        assert_eq!(row.attempts, 1);

        let other = q.enqueue("t1", "+919876543211", "s", 1, None).unwrap();
        q.cancel(&other.id).unwrap();
        clock.advance(Duration::days(29));
        assert_eq!(q.cleanup().unwrap(), 0);
        clock.advance(Duration::days(2));
        assert_eq!(q.cleanup().unwrap(), 1);
        assert!(q.get(&other.id).unwrap().archived_at.is_some());
        assert_eq!(q.list(Some("t1"), None).unwrap().len(), 1);
    }
}
