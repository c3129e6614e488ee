//! Job scheduler: one declarative job table per worker process.
//!
//! Every tick of every job first takes the job's lease. Only the replica
//! that gets it runs the body; the others skip the tick and leave the
//! holder's `job_runs` row alone. While the body runs the lease is renewed
//! every `renew_every`. A failed renewal drops the body future on the spot.
//!
//! ```text
//! tick ──▶ acquire(job:<name>) ──busy──▶ skipped (not recorded)
//!              │
//!              ▼
//!     ┌─ body ───────────────┐   select!
//!     ├─ keep-alive (renew) ─┤──▶ ran | failed | panicked | lease_lost | aborted
//!     └─ shutdown + grace ───┘
//!              │
//!              ▼
//!         release + job_runs
//! ```

use async_trait::async_trait;
use bharat_core::config::SchedulerConfig;
use bharat_core::error::{CrmError, Result};
use bharat_core::Clock;
use bharat_db::CrmDb;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::lock::{LeaseToken, LockManager, Renewal, lock_key_for};

/// A scheduled job body.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<()>;
}

/// Handed to a running body: time, and the abort signals it must honour.
pub struct JobContext {
    job: String,
    key: String,
    tick_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    lease_lost: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    lease: Option<(LockManager, LeaseToken)>,
}

impl JobContext {
    /// A context outside the scheduler (operator commands, tests). Its
    /// signals never fire.
    pub fn standalone(job: &str, clock: Arc<dyn Clock>) -> Self {
        let (_, lease_lost) = watch::channel(false);
        let (_, shutdown) = watch::channel(false);
        Self {
            job: job.to_string(),
            key: lock_key_for(job),
            tick_at: clock.now(),
            clock,
            lease_lost,
            shutdown,
            lease: None,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job
    }

    pub fn tick_at(&self) -> DateTime<Utc> {
        self.tick_at
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Call before every side effect.
    pub fn checkpoint(&self) -> Result<()> {
        if *self.lease_lost.borrow() {
            return Err(CrmError::LeaseLost { key: self.key.clone() });
        }
        if *self.shutdown.borrow() {
            return Err(CrmError::ShuttingDown);
        }
        Ok(())
    }

    /// Checkpoint for bodies that do long stretches of blocking work. Reads
    /// the lease back from the store instead of waiting for the next renewal,
    /// then yields so keep-alive and the shutdown watch get polled.
    pub async fn confirm_lease(&self) -> Result<()> {
        self.checkpoint()?;
        if let Some((locks, lease)) = &self.lease {
            if !locks.still_holds(lease).await? {
                return Err(CrmError::LeaseLost { key: self.key.clone() });
            }
        }
        tokio::task::yield_now().await;
        self.checkpoint()
    }

    /// Sleep, waking early on lease loss or shutdown.
    pub async fn pause(&self, dur: Duration) -> Result<()> {
        if !dur.is_zero() {
            let mut lost = self.lease_lost.clone();
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(dur) => {}
                _ = signalled(&mut lost) => {}
                _ = signalled(&mut shutdown) => {}
            }
        }
        self.checkpoint()
    }
}

/// Resolves once the flag turns true. Never resolves if the sender is gone.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|v| *v).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Ran,
    /// Another replica holds the lease.
    Skipped,
    Failed(String),
    Panicked(String),
    LeaseLost,
    /// Stopped for shutdown.
    Aborted,
}

impl TickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickOutcome::Ran => "ran",
            TickOutcome::Skipped => "skipped",
            TickOutcome::Failed(_) => "failed",
            TickOutcome::Panicked(_) => "panicked",
            TickOutcome::LeaseLost => "lease_lost",
            TickOutcome::Aborted => "aborted",
        }
    }

    fn error(&self) -> Option<&str> {
        match self {
            TickOutcome::Failed(e) | TickOutcome::Panicked(e) => Some(e),
            _ => None,
        }
    }
}

/// Lease and shutdown timing.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub node_id: String,
    pub lease_ttl: Duration,
    pub renew_every: Duration,
    pub shutdown_grace: Duration,
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(c: &SchedulerConfig) -> Self {
        Self {
            node_id: c.node_id.clone(),
            lease_ttl: c.lease_ttl(),
            renew_every: c.renew_every(),
            shutdown_grace: c.shutdown_grace(),
        }
    }
}

struct JobEntry {
    name: String,
    interval: Duration,
    job: Arc<dyn Job>,
}

/// Tick-driven dispatcher over a declarative job table.
pub struct JobScheduler {
    jobs: Vec<JobEntry>,
    locks: LockManager,
    db: Arc<CrmDb>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    shutdown_tx: watch::Sender<bool>,
}

impl JobScheduler {
    pub fn new(locks: LockManager, db: Arc<CrmDb>, clock: Arc<dyn Clock>, settings: SchedulerSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            locks,
            db,
            clock,
            settings,
            shutdown_tx,
        }
    }

    /// Add a job to the table. Names must be unique.
    pub fn register(&mut self, name: &str, interval: Duration, job: Arc<dyn Job>) -> Result<()> {
        if self.jobs.iter().any(|j| j.name == name) {
            return Err(CrmError::Config(format!("job '{name}' registered twice")));
        }
        if interval.is_zero() {
            return Err(CrmError::Config(format!("job '{name}' has a zero interval")));
        }
        tracing::info!("📅 Job registered: '{name}' every {}s", interval.as_secs());
        self.jobs.push(JobEntry {
            name: name.to_string(),
            interval,
            job,
        });
        Ok(())
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    /// Drive a single tick of `name`.
    pub async fn tick_once(&self, name: &str) -> Result<TickOutcome> {
        let entry = self
            .jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| CrmError::NotFound(format!("job '{name}'")))?;
        Ok(self.run_tick(entry).await)
    }

    async fn run_tick(&self, entry: &JobEntry) -> TickOutcome {
        let tick_at = self.clock.now();
        let key = lock_key_for(&entry.name);

        let lease = match self.locks.acquire(&key, self.settings.lease_ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::debug!("⏭️ [{}] lease busy, tick skipped", entry.name);
                return TickOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!("⚠️ [{}] lease store unavailable: {e}", entry.name);
                let outcome = TickOutcome::Failed(e.to_string());
                self.record(&entry.name, tick_at, &outcome, false);
                return outcome;
            }
        };

        let (lost_tx, lost_rx) = watch::channel(false);
        let ctx = JobContext {
            job: entry.name.clone(),
            key,
            tick_at,
            clock: self.clock.clone(),
            lease_lost: lost_rx,
            shutdown: self.shutdown_tx.subscribe(),
            lease: Some((self.locks.clone(), lease.clone())),
        };

        tracing::debug!("▶️ [{}] tick at {tick_at}", entry.name);
        let body = AssertUnwindSafe(entry.job.run(&ctx)).catch_unwind();
        let keep_alive = self.keep_alive(&lease, lost_tx);
        let mut shutdown = self.shutdown_tx.subscribe();
        let grace = self.settings.shutdown_grace;
        let grace_expired = async move {
            signalled(&mut shutdown).await;
            tokio::time::sleep(grace).await;
        };

        let outcome = tokio::select! {
            result = body => match result {
                Ok(Ok(())) => TickOutcome::Ran,
                Ok(Err(CrmError::LeaseLost { .. })) => TickOutcome::LeaseLost,
                Ok(Err(CrmError::ShuttingDown)) => TickOutcome::Aborted,
                Ok(Err(e)) => {
                    if e.is_transient() {
                        tracing::warn!("⚠️ [{}] tick at {tick_at} failed, retrying next tick: {e}", entry.name);
                    } else {
                        tracing::error!("❌ [{}] tick at {tick_at} failed: {e}", entry.name);
                    }
                    TickOutcome::Failed(e.to_string())
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    tracing::error!("💥 [{}] tick at {tick_at} panicked: {msg}", entry.name);
                    TickOutcome::Panicked(msg)
                }
            },
            _ = keep_alive => {
                tracing::warn!("⚠️ [{}] lease lost mid-run, body aborted", entry.name);
                TickOutcome::LeaseLost
            },
            _ = grace_expired => {
                tracing::warn!("⏱️ [{}] shutdown grace expired, body aborted", entry.name);
                TickOutcome::Aborted
            },
        };

        if let Err(e) = self.locks.release(&lease).await {
            tracing::warn!("⚠️ [{}] lease release failed (expires on its own): {e}", entry.name);
        }
        match &outcome {
            TickOutcome::Ran => tracing::debug!("✅ [{}] tick done", entry.name),
            TickOutcome::Aborted => tracing::info!("🛑 [{}] stopped for shutdown", entry.name),
            _ => {}
        }
        self.record(&entry.name, tick_at, &outcome, true);
        outcome
    }

    /// Renew until the lease is lost; resolves only then.
    async fn keep_alive(&self, lease: &LeaseToken, lost_tx: watch::Sender<bool>) {
        let mut every = tokio::time::interval(self.settings.renew_every);
        every.set_missed_tick_behavior(MissedTickBehavior::Delay);
        every.tick().await;
        loop {
            every.tick().await;
            match self.locks.renew(lease, self.settings.lease_ttl).await {
                Ok(Renewal::Renewed(_)) => {}
                Ok(Renewal::Lost) => {
                    let _ = lost_tx.send(true);
                    return;
                }
                // Transient: the next attempt either renews or observes the loss.
                Err(e) => tracing::warn!("⚠️ Lease renew error for {}: {e}", lease.key),
            }
        }
    }

    fn record(&self, job: &str, tick_at: DateTime<Utc>, outcome: &TickOutcome, ran: bool) {
        let ran_at = ran.then_some(tick_at);
        if let Err(e) = self.db.record_job_run(
            job,
            tick_at,
            outcome.as_str(),
            ran_at,
            outcome.error(),
            ran.then_some(self.settings.node_id.as_str()),
        ) {
            tracing::warn!("⚠️ [{job}] could not record tick: {e}");
        }
    }

    /// Signal shutdown: no new ticks start; in-flight bodies see it at their
    /// next checkpoint and are dropped after the grace period.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Run every job on its own timer until `stop` turns true.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ Scheduler started on '{}' with {} job(s), lease ttl {}s",
            self.settings.node_id,
            self.jobs.len(),
            self.settings.lease_ttl.as_secs()
        );

        let mut loops = tokio::task::JoinSet::new();
        for idx in 0..self.jobs.len() {
            let sched = self.clone();
            loops.spawn(async move { sched.job_loop(idx).await });
        }

        signalled(&mut stop).await;
        tracing::info!("🛑 Shutdown requested, waiting for in-flight jobs");
        self.shutdown();

        let deadline = self.settings.shutdown_grace + Duration::from_secs(5);
        if tokio::time::timeout(deadline, async { while loops.join_next().await.is_some() {} })
            .await
            .is_err()
        {
            tracing::warn!("⚠️ Job loops did not stop in time, aborting");
            loops.abort_all();
        }
        tracing::info!("👋 Scheduler stopped");
    }

    async fn job_loop(&self, idx: usize) {
        let entry = &self.jobs[idx];
        let mut interval = tokio::time::interval(entry.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = signalled(&mut shutdown) => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.run_tick(entry).await;
        }
        tracing::debug!("[{}] loop stopped", entry.name);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLeaseStore;
    use bharat_core::ManualClock;
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(node: &str) -> SchedulerSettings {
        SchedulerSettings {
            node_id: node.into(),
            lease_ttl: Duration::from_secs(30),
            renew_every: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    struct Fixture {
        db: Arc<CrmDb>,
        clock: ManualClock,
        store: Arc<MemoryLeaseStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: Arc::new(CrmDb::open(Path::new(":memory:")).unwrap()),
                clock: ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()),
                store: Arc::new(MemoryLeaseStore::new()),
            }
        }

        fn locks(&self) -> LockManager {
            LockManager::new(self.store.clone(), Arc::new(self.clock.clone()))
        }

        fn scheduler(&self, node: &str) -> JobScheduler {
            JobScheduler::new(self.locks(), self.db.clone(), Arc::new(self.clock.clone()), settings(node))
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl Job for Counter {
        async fn run(&self, ctx: &JobContext) -> Result<()> {
            ctx.checkpoint()?;
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Job for Panics {
        async fn run(&self, _ctx: &JobContext) -> Result<()> {
            panic!("boom");
        }
    }

    struct Fails;

    #[async_trait]
    impl Job for Fails {
        async fn run(&self, _ctx: &JobContext) -> Result<()> {
            Err(CrmError::store("database is locked"))
        }
    }

    /// Waits until told to go, then counts.
    struct Gate {
        go: tokio::sync::Notify,
        done: AtomicUsize,
    }

    #[async_trait]
    impl Job for Gate {
        async fn run(&self, ctx: &JobContext) -> Result<()> {
            self.go.notified().await;
            ctx.checkpoint()?;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Sleeps through checkpoints it never calls.
    struct Stubborn;

    #[async_trait]
    impl Job for Stubborn {
        async fn run(&self, _ctx: &JobContext) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tick_runs_and_records() {
        let fx = Fixture::new();
        let counter = Arc::new(Counter::default());
        let mut sched = fx.scheduler("node-a");
        sched.register("count", Duration::from_secs(30), counter.clone()).unwrap();

        assert_eq!(sched.tick_once("count").await.unwrap(), TickOutcome::Ran);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        // Released on return: the next tick runs too.
        assert_eq!(sched.tick_once("count").await.unwrap(), TickOutcome::Ran);

        let runs = fx.db.list_job_runs().unwrap();
        assert_eq!(runs[0].job_name, "count");
        assert_eq!(runs[0].last_outcome, "ran");
        assert_eq!(runs[0].holder.as_deref(), Some("node-a"));
        assert!(sched.tick_once("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let fx = Fixture::new();
        let mut sched = fx.scheduler("n");
        sched.register("a", Duration::from_secs(1), Arc::new(Counter::default())).unwrap();
        assert!(sched.register("a", Duration::from_secs(1), Arc::new(Counter::default())).is_err());
        assert!(sched.register("b", Duration::ZERO, Arc::new(Counter::default())).is_err());
        assert_eq!(sched.job_names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_second_replica_skips_while_first_runs() {
        let fx = Fixture::new();
        let gate = Arc::new(Gate { go: tokio::sync::Notify::new(), done: AtomicUsize::new(0) });
        let mut a = fx.scheduler("node-a");
        let mut b = fx.scheduler("node-b");
        a.register("campaigns", Duration::from_secs(30), gate.clone()).unwrap();
        b.register("campaigns", Duration::from_secs(30), gate.clone()).unwrap();

        let first = a.tick_once("campaigns");
        let second = async {
            tokio::task::yield_now().await;
            let outcome = b.tick_once("campaigns").await.unwrap();
            gate.go.notify_one();
            outcome
        };
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap(), TickOutcome::Ran);
        assert_eq!(second, TickOutcome::Skipped);
        assert_eq!(gate.done.load(Ordering::SeqCst), 1);

        let runs = fx.db.list_job_runs().unwrap();
        assert_eq!(runs[0].last_outcome, "ran");
        assert_eq!(runs[0].holder.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_skipped_tick_keeps_holders_failure() {
        let fx = Fixture::new();
        let mut a = fx.scheduler("node-a");
        let mut b = fx.scheduler("node-b");
        a.register("flaky", Duration::from_secs(30), Arc::new(Fails)).unwrap();
        b.register("flaky", Duration::from_secs(30), Arc::new(Fails)).unwrap();

        assert!(matches!(a.tick_once("flaky").await.unwrap(), TickOutcome::Failed(_)));
        // node-a is busy with its next tick when node-b's timer fires.
        let held = fx.locks().acquire(&lock_key_for("flaky"), Duration::from_secs(30)).await.unwrap();
        assert!(held.is_some());
        fx.clock.advance(chrono::Duration::seconds(10));
        assert_eq!(b.tick_once("flaky").await.unwrap(), TickOutcome::Skipped);

        let runs = fx.db.list_job_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].last_outcome, "failed");
        assert_eq!(runs[0].last_error.as_deref(), Some("Store error: database is locked"));
        assert_eq!(runs[0].holder.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_lease_released() {
        let fx = Fixture::new();
        let mut sched = fx.scheduler("n");
        sched.register("bad", Duration::from_secs(30), Arc::new(Panics)).unwrap();

        let outcome = sched.tick_once("bad").await.unwrap();
        assert_eq!(outcome, TickOutcome::Panicked("boom".into()));
        assert!(!fx.locks().is_held(&lock_key_for("bad")).await.unwrap());

        let runs = fx.db.list_job_runs().unwrap();
        assert_eq!(runs[0].last_outcome, "panicked");
        assert_eq!(runs[0].last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_error_is_recorded_and_lease_released() {
        let fx = Fixture::new();
        let mut sched = fx.scheduler("n");
        sched.register("flaky", Duration::from_secs(30), Arc::new(Fails)).unwrap();
        let outcome = sched.tick_once("flaky").await.unwrap();
        assert!(matches!(outcome, TickOutcome::Failed(ref e) if e.contains("locked")));
        assert!(!fx.locks().is_held(&lock_key_for("flaky")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_loss_aborts_body() {
        let fx = Fixture::new();
        let gate = Arc::new(Gate { go: tokio::sync::Notify::new(), done: AtomicUsize::new(0) });
        let mut sched = fx.scheduler("node-a");
        sched.register("calls", Duration::from_secs(15), gate.clone()).unwrap();

        let run = sched.tick_once("calls");
        let steal = async {
            tokio::task::yield_now().await;
            // Lease TTL passes on the virtual clock; another replica takes over.
            fx.clock.advance(chrono::Duration::seconds(31));
            let thief = fx.locks().acquire(&lock_key_for("calls"), Duration::from_secs(30)).await.unwrap();
            assert!(thief.is_some());
        };
        let (outcome, _) = tokio::join!(run, steal);
        assert_eq!(outcome.unwrap(), TickOutcome::LeaseLost);
        assert_eq!(gate.done.load(Ordering::SeqCst), 0);
        // The thief's lease is untouched by the aborted holder's release.
        assert!(fx.locks().is_held(&lock_key_for("calls")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_grace_bounds_body() {
        let fx = Fixture::new();
        let mut sched = fx.scheduler("n");
        sched.register("slow", Duration::from_secs(60), Arc::new(Stubborn)).unwrap();

        let run = sched.tick_once("slow");
        let stop = async {
            tokio::task::yield_now().await;
            sched.shutdown();
        };
        let (outcome, _) = tokio::join!(run, stop);
        assert_eq!(outcome.unwrap(), TickOutcome::Aborted);
        assert!(!fx.locks().is_held(&lock_key_for("slow")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_stopped() {
        let fx = Fixture::new();
        let counter = Arc::new(Counter::default());
        let mut sched = fx.scheduler("n");
        sched.register("count", Duration::from_secs(10), counter.clone()).unwrap();
        let sched = Arc::new(sched);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sched.clone().run(stop_rx));
        tokio::time::sleep(Duration::from_secs(35)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        // Ticks at 0, 10, 20, 30.
        assert_eq!(counter.0.load(Ordering::SeqCst), 4);
        let runs = fx.db.list_job_runs().unwrap();
        assert_eq!(runs[0].last_outcome, "ran");
    }

    #[test]
    fn test_context_checkpoint() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let ctx = JobContext::standalone("manual", clock);
        assert!(ctx.checkpoint().is_ok());
        assert_eq!(ctx.job_name(), "manual");
    }

    #[tokio::test]
    async fn test_standalone_confirm_lease() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let ctx = JobContext::standalone("manual", clock);
        assert!(ctx.confirm_lease().await.is_ok());
    }
}
