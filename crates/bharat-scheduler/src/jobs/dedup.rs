//! Scheduled full conversation dedup pass.

use async_trait::async_trait;
use bharat_conversations::dedup::TRIGGER_SCHEDULED;
use bharat_conversations::DedupEngine;
use bharat_core::error::Result;

use crate::engine::{Job, JobContext};

pub struct ConversationDedupJob {
    engine: DedupEngine,
}

impl ConversationDedupJob {
    pub fn new(engine: DedupEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Job for ConversationDedupJob {
    async fn run(&self, ctx: &JobContext) -> Result<()> {
        self.engine
            .reconcile_all_with(None, TRIGGER_SCHEDULED, move || ctx.confirm_lease())
            .await?;
        Ok(())
    }
}
