//! Suspends trial tenants whose subscription has ended.

use async_trait::async_trait;
use bharat_core::error::Result;
use bharat_db::CrmDb;
use std::sync::Arc;

use crate::engine::{Job, JobContext};

pub struct TrialExpiryJob {
    db: Arc<CrmDb>,
}

impl TrialExpiryJob {
    pub fn new(db: Arc<CrmDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Job for TrialExpiryJob {
    async fn run(&self, ctx: &JobContext) -> Result<()> {
        let now = ctx.now();
        let mut suspended = 0u64;
        for tenant in self.db.expired_trials(now)? {
            ctx.checkpoint()?;
            // Conditional: an upgrade that lands between select and update wins.
            if self.db.suspend_expired_trial(&tenant.id, now)? {
                tracing::info!("⏳ Trial expired, tenant '{}' ({}) suspended", tenant.name, tenant.id);
                suspended += 1;
            }
        }
        if suspended > 0 {
            tracing::info!("⏳ Suspended {suspended} expired trial(s)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bharat_core::{Clock, ManualClock};
    use chrono::{Duration, TimeZone, Utc};
    use std::path::Path;

    #[tokio::test]
    async fn test_suspends_only_expired_trials_once() {
        let db = Arc::new(CrmDb::open(Path::new(":memory:")).unwrap());
        let manual = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(manual.clone());
        let now = clock.now();

        let expired = db.create_tenant("Expired", "trial", Some(now - Duration::days(1)), None, now).unwrap();
        let running = db.create_tenant("Running", "trial", Some(now + Duration::days(3)), None, now).unwrap();
        let paid = db.create_tenant("Paid", "pro", Some(now - Duration::days(10)), None, now).unwrap();
        let upgraded = db.create_tenant("Upgraded", "trial", Some(now - Duration::days(2)), None, now).unwrap();
        db.update_tenant_plan(&upgraded.id, "starter", Some(now + Duration::days(30))).unwrap();

        let job = TrialExpiryJob::new(db.clone());
        job.run(&JobContext::standalone("trial-expiry", clock.clone())).await.unwrap();

        assert_eq!(db.get_tenant(&expired.id).unwrap().status, "suspended");
        for id in [&running.id, &paid.id, &upgraded.id] {
            assert_eq!(db.get_tenant(id).unwrap().status, "active");
        }

        // Rerun is a no-op.
        job.run(&JobContext::standalone("trial-expiry", clock.clone())).await.unwrap();
        assert!(db.expired_trials(clock.now()).unwrap().is_empty());

        // The running trial lapses later.
        manual.advance(Duration::days(4));
        job.run(&JobContext::standalone("trial-expiry", clock.clone())).await.unwrap();
        assert_eq!(db.get_tenant(&running.id).unwrap().status, "suspended");
    }
}
