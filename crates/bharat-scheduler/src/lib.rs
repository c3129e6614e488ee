//! # Bharat Scheduler
//!
//! Runs the CRM's recurring background work across any number of worker
//! replicas. Each job tick is guarded by a lease, so exactly one replica
//! executes a given job at a time; all progress is persisted in the record
//! store so a replica that dies midway is picked up on the next tick.
//!
//! ## Architecture
//! ```text
//! JobScheduler (one tokio task per job, interval ticks)
//!   └── tick ── LockManager.acquire("job:<name>")
//!                ├── held elsewhere → skipped
//!                └── acquired → Job::run(ctx)  ┐
//!                                keep-alive ───┤ renew every lease_ttl/3
//!                                shutdown ─────┘ grace, then abort
//!                    → release → job_runs
//!
//! Jobs
//!   ├── campaign-dispatcher  batches → NotificationDispatcher
//!   ├── lead-reminders       due follow-ups → NotificationDispatcher
//!   ├── call-queue           recover stale, dial due → TelephonyProvider
//!   ├── call-queue-cleanup   archive finished items
//!   ├── trial-expiry         suspend lapsed trials
//!   └── conversation-dedup   DedupEngine full pass
//! ```

pub mod call_queue;
pub mod dispatch;
pub mod engine;
pub mod jobs;
pub mod lock;

#[cfg(test)]
mod testing;

pub use call_queue::{CallPassStats, CallQueue};
pub use dispatch::{dispatcher_from_config, telephony_from_config};
pub use engine::{Job, JobContext, JobScheduler, SchedulerSettings, TickOutcome};
pub use jobs::{JobDeps, register_all};
pub use lock::{LeaseStore, LeaseToken, LockManager, MemoryLeaseStore, Renewal, SqliteLeaseStore};
