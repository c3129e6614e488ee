//! The recurring jobs and the table that wires them into a scheduler.

pub mod call_queue;
pub mod campaigns;
pub mod dedup;
pub mod reminders;
pub mod trial_expiry;

pub use call_queue::{CallCleanupJob, CallQueueJob};
pub use campaigns::CampaignDispatcherJob;
pub use dedup::ConversationDedupJob;
pub use reminders::LeadReminderJob;
pub use trial_expiry::TrialExpiryJob;

use bharat_conversations::DedupEngine;
use bharat_core::config::{CrmConfig, JobConfig};
use bharat_core::error::Result;
use bharat_core::traits::{NotificationDispatcher, TelephonyProvider};
use bharat_core::Clock;
use bharat_db::CrmDb;
use std::sync::Arc;

use crate::call_queue::CallQueue;
use crate::engine::{Job, JobScheduler};

pub const CAMPAIGN_DISPATCHER: &str = "campaign-dispatcher";
pub const LEAD_REMINDERS: &str = "lead-reminders";
pub const CALL_QUEUE: &str = "call-queue";
pub const CALL_QUEUE_CLEANUP: &str = "call-queue-cleanup";
pub const TRIAL_EXPIRY: &str = "trial-expiry";
pub const CONVERSATION_DEDUP: &str = "conversation-dedup";

/// Everything the jobs need from the outside.
#[derive(Clone)]
pub struct JobDeps {
    pub db: Arc<CrmDb>,
    pub clock: Arc<dyn Clock>,
    pub dispatcher: Arc<dyn NotificationDispatcher>,
    pub telephony: Arc<dyn TelephonyProvider>,
}

/// Register every enabled job. Returns the names registered.
pub fn register_all(scheduler: &mut JobScheduler, config: &CrmConfig, deps: &JobDeps) -> Result<Vec<String>> {
    let queue = CallQueue::new(deps.db.clone(), deps.clock.clone(), config.calls.clone());
    let dedup = DedupEngine::new(deps.db.clone(), deps.clock.clone(), config.dedup.default_country.clone());

    let mut table: Vec<(&str, &JobConfig, Arc<dyn Job>)> = Vec::new();
    table.push((
        CAMPAIGN_DISPATCHER,
        &config.jobs.campaigns,
        Arc::new(CampaignDispatcherJob::new(
            deps.db.clone(),
            deps.dispatcher.clone(),
            config.campaign.batch_size,
            config.campaign.inter_batch_delay(),
        )),
    ));
    table.push((
        LEAD_REMINDERS,
        &config.jobs.lead_reminders,
        Arc::new(LeadReminderJob::new(
            deps.db.clone(),
            deps.dispatcher.clone(),
            &config.reminders.channel,
            config.reminders.batch_limit,
        )),
    ));
    table.push((
        CALL_QUEUE,
        &config.jobs.call_queue,
        Arc::new(CallQueueJob::new(queue.clone(), deps.telephony.clone())),
    ));
    table.push((CALL_QUEUE_CLEANUP, &config.jobs.call_cleanup, Arc::new(CallCleanupJob::new(queue))));
    table.push((TRIAL_EXPIRY, &config.jobs.trial_expiry, Arc::new(TrialExpiryJob::new(deps.db.clone()))));
    table.push((
        CONVERSATION_DEDUP,
        &config.jobs.conversation_dedup,
        Arc::new(ConversationDedupJob::new(dedup)),
    ));

    let mut registered = Vec::new();
    for (name, job_config, job) in table {
        if !job_config.enabled {
            tracing::info!("⏸️ Job '{name}' disabled");
            continue;
        }
        scheduler.register(name, job_config.interval(), job)?;
        registered.push(name.to_string());
    }
    Ok(registered)
}
