//! Call queue processor and the retention sweep.

use async_trait::async_trait;
use bharat_core::error::{CrmError, Result};
use bharat_core::traits::TelephonyProvider;
use std::sync::Arc;

use crate::call_queue::{CallPassStats, CallQueue};
use crate::engine::{Job, JobContext};

pub struct CallQueueJob {
    queue: CallQueue,
    telephony: Arc<dyn TelephonyProvider>,
}

impl CallQueueJob {
    pub fn new(queue: CallQueue, telephony: Arc<dyn TelephonyProvider>) -> Self {
        Self { queue, telephony }
    }

    /// Recover interrupted items, then dial every due item in priority order.
    pub async fn process(&self, ctx: &JobContext) -> Result<CallPassStats> {
        let mut stats = CallPassStats {
            recovered: self.queue.recover_stale()?,
            ..Default::default()
        };

        for item in self.queue.due(self.queue.policy().batch_limit)? {
            ctx.checkpoint()?;
            if !self.queue.start(&item)? {
                continue;
            }
            stats.started += 1;
            tracing::info!("📞 Dialling {} (call {}, attempt {})", item.target_phone, item.id, item.attempts + 1);

            match self.telephony.place_call(&item.target_phone, &item.script).await {
                Ok(outcome) => match self.queue.complete(&item, outcome.transcript.as_deref()) {
                    Ok(()) => stats.completed += 1,
                    Err(CrmError::Conflict(msg)) => tracing::warn!("⚠️ Call {} moved on mid-call: {msg}", item.id),
                    Err(e) => return Err(e),
                },
                Err(e) => {
                    tracing::warn!("⚠️ Call {} to {} failed: {e}", item.id, item.target_phone);
                    stats.failed += 1;
                    match self.queue.fail(&item, &e.to_string()) {
                        Ok(true) => stats.requeued += 1,
                        Ok(false) => {}
                        Err(CrmError::Conflict(msg)) => tracing::warn!("⚠️ Call {} moved on mid-call: {msg}", item.id),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl Job for CallQueueJob {
    async fn run(&self, ctx: &JobContext) -> Result<()> {
        let stats = self.process(ctx).await?;
        if stats != CallPassStats::default() {
            tracing::info!(
                "📞 Call pass: {} recovered, {} dialled, {} completed, {} failed ({} re-queued)",
                stats.recovered, stats.started, stats.completed, stats.failed, stats.requeued
            );
        }
        Ok(())
    }
}

pub struct CallCleanupJob {
    queue: CallQueue,
}

impl CallCleanupJob {
    pub fn new(queue: CallQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Job for CallCleanupJob {
    async fn run(&self, _ctx: &JobContext) -> Result<()> {
        self.queue.cleanup()?;
        Ok(())
    }
}
