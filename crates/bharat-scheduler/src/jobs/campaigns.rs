//! Campaign dispatcher: sends due campaigns in rate-limited batches.
//!
//! Progress lives in `campaign_recipients`, one conditional
//! `pending → sent | failed` update per recipient, so a run that dies
//! midway resumes on the next tick without re-sending anyone.

use async_trait::async_trait;
use bharat_core::error::Result;
use bharat_core::traits::NotificationDispatcher;
use bharat_core::types::{Campaign, CampaignStatus, RecipientStatus};
use bharat_db::CrmDb;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Job, JobContext};

pub struct CampaignDispatcherJob {
    db: Arc<CrmDb>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    batch_size: u64,
    inter_batch_delay: Duration,
}

impl CampaignDispatcherJob {
    pub fn new(
        db: Arc<CrmDb>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        batch_size: u64,
        inter_batch_delay: Duration,
    ) -> Self {
        Self {
            db,
            dispatcher,
            batch_size: batch_size.max(1),
            inter_batch_delay,
        }
    }

    async fn send_campaign(&self, ctx: &JobContext, campaign: &Campaign) -> Result<()> {
        let mut first = true;
        loop {
            let batch = self.db.pending_recipients(&campaign.id, self.batch_size)?;
            if batch.is_empty() {
                break;
            }
            if !first {
                ctx.pause(self.inter_batch_delay).await?;
                if self.db.get_campaign(&campaign.id)?.status != CampaignStatus::Running {
                    tracing::info!("🛑 Campaign '{}' no longer running, stopping", campaign.name);
                    return Ok(());
                }
            }
            first = false;

            for recipient in batch {
                ctx.checkpoint()?;
                let (status, error) = match self
                    .dispatcher
                    .send(&campaign.channel, &recipient.recipient, &campaign.payload)
                    .await
                {
                    Ok(()) => (RecipientStatus::Sent, None),
                    Err(e) => {
                        tracing::warn!(
                            "⚠️ Campaign '{}' → {} failed: {e}",
                            campaign.name, recipient.recipient
                        );
                        (RecipientStatus::Failed, Some(e.to_string()))
                    }
                };
                self.db.mark_recipient(recipient.id, status, error.as_deref(), ctx.now())?;
            }
        }

        let counts = self.db.recipient_counts(&campaign.id)?;
        if self
            .db
            .set_campaign_status(&campaign.id, CampaignStatus::Running, CampaignStatus::Completed, ctx.now())?
        {
            tracing::info!(
                "✅ Campaign '{}' completed: {} sent, {} failed",
                campaign.name, counts.sent, counts.failed
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Job for CampaignDispatcherJob {
    async fn run(&self, ctx: &JobContext) -> Result<()> {
        for campaign in self.db.due_campaigns(ctx.now())? {
            ctx.checkpoint()?;
            if campaign.status == CampaignStatus::Scheduled {
                if !self.db.set_campaign_status(
                    &campaign.id,
                    CampaignStatus::Scheduled,
                    CampaignStatus::Running,
                    ctx.now(),
                )? {
                    continue;
                }
                tracing::info!("📣 Campaign '{}' ({}) started", campaign.name, campaign.channel);
            } else {
                tracing::info!("📣 Campaign '{}' resuming", campaign.name);
            }
            self.send_campaign(ctx, &campaign).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDispatcher;
    use bharat_core::{Clock, ManualClock};
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;
    use std::path::Path;

    fn setup() -> (Arc<CrmDb>, Arc<dyn Clock>) {
        let db = Arc::new(CrmDb::open(Path::new(":memory:")).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
        (db, clock)
    }

    fn campaign_with(db: &CrmDb, clock: &Arc<dyn Clock>, n: usize) -> Campaign {
        let c = db
            .create_campaign("t1", "Holi sale", "whatsapp", "20% off", clock.now(), clock.now())
            .unwrap();
        let recipients: Vec<String> = (0..n).map(|i| format!("+9198000{i:05}")).collect();
        let refs: Vec<&str> = recipients.iter().map(String::as_str).collect();
        db.add_recipients(&c.id, &refs).unwrap();
        c
    }

    #[tokio::test]
    async fn test_sends_all_and_completes() {
        let (db, clock) = setup();
        let c = campaign_with(&db, &clock, 7);
        let dispatcher = Arc::new(RecordingDispatcher::failing(&["+919800000003"]));
        let job = CampaignDispatcherJob::new(db.clone(), dispatcher.clone(), 3, Duration::ZERO);

        job.run(&JobContext::standalone("campaigns", clock.clone())).await.unwrap();

        assert_eq!(dispatcher.recipients().len(), 6);
        let counts = db.recipient_counts(&c.id).unwrap();
        assert_eq!((counts.pending, counts.sent, counts.failed), (0, 6, 1));
        assert_eq!(db.get_campaign(&c.id).unwrap().status, CampaignStatus::Completed);

        // Nothing left to do.
        job.run(&JobContext::standalone("campaigns", clock.clone())).await.unwrap();
        assert_eq!(dispatcher.recipients().len(), 6);
    }

    #[tokio::test]
    async fn test_future_campaign_not_started() {
        let (db, clock) = setup();
        let later = db
            .create_campaign("t1", "Later", "email", "x", clock.now() + chrono::Duration::hours(1), clock.now())
            .unwrap();
        db.add_recipients(&later.id, &["a@example.com"]).unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let job = CampaignDispatcherJob::new(db.clone(), dispatcher.clone(), 50, Duration::ZERO);
        job.run(&JobContext::standalone("campaigns", clock)).await.unwrap();
        assert!(dispatcher.recipients().is_empty());
        assert_eq!(db.get_campaign(&later.id).unwrap().status, CampaignStatus::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_killed_after_50_of_500_resumes_without_resending() {
        let (db, clock) = setup();
        let c = campaign_with(&db, &clock, 500);

        // First worker dies while its 51st send is in flight.
        let dying = Arc::new(RecordingDispatcher {
            hang_after: Some(50),
            ..Default::default()
        });
        let job = CampaignDispatcherJob::new(db.clone(), dying.clone(), 50, Duration::from_millis(100));
        let ctx = JobContext::standalone("campaigns", clock.clone());
        let killed = tokio::time::timeout(Duration::from_secs(5), job.run(&ctx)).await;
        assert!(killed.is_err());
        assert_eq!(dying.recipients().len(), 50);
        assert_eq!(db.recipient_counts(&c.id).unwrap().sent, 50);
        assert_eq!(db.get_campaign(&c.id).unwrap().status, CampaignStatus::Running);

        // Second worker picks it up on the next tick.
        let fresh = Arc::new(RecordingDispatcher::default());
        let job = CampaignDispatcherJob::new(db.clone(), fresh.clone(), 50, Duration::from_millis(100));
        job.run(&JobContext::standalone("campaigns", clock.clone())).await.unwrap();

        assert_eq!(fresh.recipients().len(), 450);
        let mut all: Vec<String> = dying.recipients();
        all.extend(fresh.recipients());
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), 500);
        assert_eq!(all.len(), 500);
        assert_eq!(db.get_campaign(&c.id).unwrap().status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_mid_run_stops() {
        let (db, clock) = setup();
        let c = campaign_with(&db, &clock, 4);
        db.set_campaign_status(&c.id, CampaignStatus::Scheduled, CampaignStatus::Running, clock.now())
            .unwrap();

        struct CancelAfterFirst {
            db: Arc<CrmDb>,
            campaign: String,
            sent: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl NotificationDispatcher for CancelAfterFirst {
            async fn send(&self, _: &str, _: &str, _: &str) -> Result<()> {
                if self.sent.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 1 {
                    self.db
                        .set_campaign_status(&self.campaign, CampaignStatus::Running, CampaignStatus::Cancelled, Utc::now())?;
                }
                Ok(())
            }
        }

        let dispatcher = Arc::new(CancelAfterFirst {
            db: db.clone(),
            campaign: c.id.clone(),
            sent: Default::default(),
        });
        let job = CampaignDispatcherJob::new(db.clone(), dispatcher, 2, Duration::ZERO);
        job.run(&JobContext::standalone("campaigns", clock)).await.unwrap();

        let counts = db.recipient_counts(&c.id).unwrap();
        assert_eq!((counts.sent, counts.pending), (2, 2));
        assert_eq!(db.get_campaign(&c.id).unwrap().status, CampaignStatus::Cancelled);
    }
}
