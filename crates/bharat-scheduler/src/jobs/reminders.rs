//! Lead follow-up reminders. One reminder per `(lead, next_follow_up_at)`.

use async_trait::async_trait;
use bharat_core::error::Result;
use bharat_core::traits::NotificationDispatcher;
use bharat_db::CrmDb;
use std::sync::Arc;

use crate::engine::{Job, JobContext};

pub struct LeadReminderJob {
    db: Arc<CrmDb>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    channel: String,
    batch_limit: u64,
}

impl LeadReminderJob {
    pub fn new(db: Arc<CrmDb>, dispatcher: Arc<dyn NotificationDispatcher>, channel: &str, batch_limit: u64) -> Self {
        Self {
            db,
            dispatcher,
            channel: channel.to_string(),
            batch_limit,
        }
    }
}

#[async_trait]
impl Job for LeadReminderJob {
    async fn run(&self, ctx: &JobContext) -> Result<()> {
        let due = self.db.due_reminders(ctx.now(), self.batch_limit)?;
        let (mut sent, mut failed) = (0u64, 0u64);

        for lead in due {
            let Some(follow_up) = lead.next_follow_up_at else { continue };
            ctx.checkpoint()?;
            let body = format!(
                "⏰ Follow-up due: {} ({})",
                lead.name,
                follow_up.format("%d %b %Y %H:%M UTC")
            );
            match self.dispatcher.send(&self.channel, &lead.owner_contact, &body).await {
                Ok(()) => {
                    if self.db.stamp_reminder(&lead.id, follow_up)? {
                        sent += 1;
                    } else {
                        tracing::debug!("Lead {} rescheduled while reminding", lead.id);
                    }
                }
                Err(e) => {
                    tracing::warn!("⚠️ Reminder for lead {} failed: {e}", lead.id);
                    self.db.record_reminder_error(&lead.id, &e.to_string(), ctx.now())?;
                    failed += 1;
                }
            }
        }

        if sent + failed > 0 {
            tracing::info!("⏰ Lead reminders: {sent} sent, {failed} failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDispatcher;
    use bharat_core::{Clock, ManualClock};
    use chrono::{Duration, TimeZone, Utc};
    use std::path::Path;

    #[tokio::test]
    async fn test_reminder_sent_once_and_retried_on_failure() {
        let db = Arc::new(CrmDb::open(Path::new(":memory:")).unwrap());
        let manual = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(manual.clone());
        let now = clock.now();

        let ok = db.create_lead("t1", "Meera", "+919811111111", Some(now - Duration::minutes(1)), now).unwrap();
        let bad = db.create_lead("t1", "Arjun", "+919822222222", Some(now - Duration::minutes(2)), now).unwrap();
        db.create_lead("t1", "Later", "+919833333333", Some(now + Duration::hours(2)), now).unwrap();

        let flaky = Arc::new(RecordingDispatcher::failing(&["+919822222222"]));
        let job = LeadReminderJob::new(db.clone(), flaky.clone(), "whatsapp", 100);
        job.run(&JobContext::standalone("lead-reminders", clock.clone())).await.unwrap();

        assert_eq!(flaky.recipients(), vec!["+919811111111".to_string()]);
        assert!(db.get_lead(&ok.id).unwrap().reminder_sent_for.is_some());
        let bad_row = db.get_lead(&bad.id).unwrap();
        assert!(bad_row.reminder_sent_for.is_none());
        assert!(bad_row.last_reminder_error.is_some());

        // Next tick with a healthy dispatcher: only the failed one goes out.
        let healthy = Arc::new(RecordingDispatcher::default());
        let job = LeadReminderJob::new(db.clone(), healthy.clone(), "whatsapp", 100);
        job.run(&JobContext::standalone("lead-reminders", clock.clone())).await.unwrap();
        assert_eq!(healthy.recipients(), vec!["+919822222222".to_string()]);
        assert!(db.get_lead(&bad.id).unwrap().last_reminder_error.is_none());

        // Rescheduling re-arms the reminder.
        db.set_follow_up(&ok.id, Some(now + Duration::hours(1))).unwrap();
        manual.advance(Duration::hours(3));
        job.run(&JobContext::standalone("lead-reminders", clock.clone())).await.unwrap();
        let sent = healthy.recipients();
        assert_eq!(sent.len(), 3);
        assert!(sent.contains(&"+919811111111".to_string()));
        assert!(sent.contains(&"+919833333333".to_string()));
    }

    #[tokio::test]
    async fn test_failing_leads_do_not_starve_the_batch() {
        let db = Arc::new(CrmDb::open(Path::new(":memory:")).unwrap());
        let manual = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(manual.clone());
        let now = clock.now();

        db.create_lead("t1", "Dead A", "+919800000001", Some(now - Duration::hours(3)), now).unwrap();
        db.create_lead("t1", "Dead B", "+919800000002", Some(now - Duration::hours(2)), now).unwrap();
        let good = db.create_lead("t1", "Nisha", "+919800000003", Some(now - Duration::hours(1)), now).unwrap();

        let dispatcher = Arc::new(RecordingDispatcher::failing(&["+919800000001", "+919800000002"]));
        let job = LeadReminderJob::new(db.clone(), dispatcher.clone(), "whatsapp", 2);

        job.run(&JobContext::standalone("lead-reminders", clock.clone())).await.unwrap();
        assert!(dispatcher.recipients().is_empty());

        manual.advance(Duration::minutes(1));
        job.run(&JobContext::standalone("lead-reminders", clock.clone())).await.unwrap();
        assert_eq!(dispatcher.recipients(), vec!["+919800000003".to_string()]);
        assert!(db.get_lead(&good.id).unwrap().reminder_sent_for.is_some());

        // The failing pair keep being retried without blocking anyone.
        for _ in 0..3 {
            manual.advance(Duration::minutes(1));
            job.run(&JobContext::standalone("lead-reminders", clock.clone())).await.unwrap();
        }
        assert_eq!(dispatcher.recipients().len(), 1);
    }
}
