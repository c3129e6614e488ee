//! Worker configuration system.
//!
//! Loaded from `~/.bharat/config.toml` (or an explicit path), then every
//! tunable can be overridden from `BHARAT_*` environment variables so
//! replicas are reconfigured without code changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CrmError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrmConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub reminders: ReminderConfig,
    #[serde(default)]
    pub calls: CallQueueConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl CrmConfig {
    /// Load config from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CrmError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CrmError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Default config path (~/.bharat/config.toml).
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Worker home directory (~/.bharat).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bharat")
    }

    /// Apply `BHARAT_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (environment in production,
    /// a map in tests).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, slot: &mut String| {
            if let Some(v) = lookup(key) {
                *slot = v;
            }
        };
        text("BHARAT_DB_PATH", &mut self.database.path);
        text("BHARAT_NODE_ID", &mut self.scheduler.node_id);
        text("BHARAT_DEFAULT_COUNTRY", &mut self.dedup.default_country);
        text("BHARAT_GATEWAY_HOST", &mut self.gateway.host);
        text("BHARAT_NOTIFY_WEBHOOK_URL", &mut self.dispatch.notify_webhook_url);
        text("BHARAT_TELEPHONY_URL", &mut self.dispatch.telephony_url);
        text("BHARAT_REMINDER_CHANNEL", &mut self.reminders.channel);

        let numbers: [(&str, &mut u64); 15] = [
            ("BHARAT_LEASE_TTL_SECS", &mut self.scheduler.lease_ttl_secs),
            ("BHARAT_SHUTDOWN_GRACE_SECS", &mut self.scheduler.shutdown_grace_secs),
            ("BHARAT_CAMPAIGN_INTERVAL_SECS", &mut self.jobs.campaigns.interval_secs),
            ("BHARAT_LEAD_REMINDER_INTERVAL_SECS", &mut self.jobs.lead_reminders.interval_secs),
            ("BHARAT_CALL_QUEUE_INTERVAL_SECS", &mut self.jobs.call_queue.interval_secs),
            ("BHARAT_CALL_CLEANUP_INTERVAL_SECS", &mut self.jobs.call_cleanup.interval_secs),
            ("BHARAT_TRIAL_EXPIRY_INTERVAL_SECS", &mut self.jobs.trial_expiry.interval_secs),
            ("BHARAT_DEDUP_INTERVAL_SECS", &mut self.jobs.conversation_dedup.interval_secs),
            ("BHARAT_CAMPAIGN_BATCH_DELAY_MS", &mut self.campaign.inter_batch_delay_ms),
            ("BHARAT_CALL_RETRY_BACKOFF_SECS", &mut self.calls.retry_backoff_secs),
            ("BHARAT_CALL_STALE_AFTER_SECS", &mut self.calls.stale_after_secs),
            ("BHARAT_CALL_RETENTION_DAYS", &mut self.calls.retention_days),
            ("BHARAT_DISPATCH_TIMEOUT_SECS", &mut self.dispatch.timeout_secs),
            ("BHARAT_CAMPAIGN_BATCH_SIZE", &mut self.campaign.batch_size),
            ("BHARAT_CALL_BATCH_LIMIT", &mut self.calls.batch_limit),
        ];
        for (key, slot) in numbers {
            if let Some(v) = lookup(key) {
                *slot = v
                    .trim()
                    .parse()
                    .map_err(|e| CrmError::Config(format!("{key}={v}: {e}")))?;
            }
        }

        if let Some(v) = lookup("BHARAT_CALL_MAX_ATTEMPTS") {
            self.calls.max_attempts = v
                .trim()
                .parse()
                .map_err(|e| CrmError::Config(format!("BHARAT_CALL_MAX_ATTEMPTS={v}: {e}")))?;
        }
        if let Some(v) = lookup("BHARAT_GATEWAY_PORT") {
            self.gateway.port = v
                .trim()
                .parse()
                .map_err(|e| CrmError::Config(format!("BHARAT_GATEWAY_PORT={v}: {e}")))?;
        }
        Ok(())
    }

    /// Reject values that would break the lease or batching contracts.
    pub fn validate(&self) -> Result<()> {
        // Renewal runs every third of the TTL with a one second floor, so
        // anything shorter leaves no room to renew before expiry.
        if self.scheduler.lease_ttl_secs < MIN_LEASE_TTL_SECS {
            return Err(CrmError::Config(format!(
                "scheduler.lease_ttl_secs must be at least {MIN_LEASE_TTL_SECS}"
            )));
        }
        if self.campaign.batch_size == 0 {
            return Err(CrmError::Config("campaign.batch_size must be > 0".into()));
        }
        if self.calls.max_attempts == 0 {
            return Err(CrmError::Config("calls.max_attempts must be > 0".into()));
        }
        for (name, job) in self.jobs.entries() {
            if job.enabled && job.interval_secs == 0 {
                return Err(CrmError::Config(format!("jobs.{name}.interval_secs must be > 0")));
            }
        }
        if self.dedup.default_country.trim().is_empty() {
            return Err(CrmError::Config("dedup.default_country must not be empty".into()));
        }
        Ok(())
    }
}

fn bool_true() -> bool { true }

/// Record store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.bharat/crm.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Shortest lease a replica may run with.
pub const MIN_LEASE_TTL_SECS: u64 = 3;

/// Scheduler and lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Identifies this replica in logs and job runs.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    /// How long an in-flight body may keep running after shutdown is signalled.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".into())
}
fn default_lease_ttl() -> u64 { 60 }
fn default_shutdown_grace() -> u64 { 30 }

impl SchedulerConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Renewal cadence: a third of the TTL, at least one second.
    pub fn renew_every(&self) -> Duration {
        Duration::from_millis((self.lease_ttl_secs.saturating_mul(1000) / 3).max(1000))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            lease_ttl_secs: default_lease_ttl(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Interval and on/off switch for a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub interval_secs: u64,
}

impl JobConfig {
    fn every(interval_secs: u64) -> Self {
        Self { enabled: true, interval_secs }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Per-job intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_campaign_job")]
    pub campaigns: JobConfig,
    #[serde(default = "default_reminder_job")]
    pub lead_reminders: JobConfig,
    #[serde(default = "default_call_queue_job")]
    pub call_queue: JobConfig,
    #[serde(default = "default_call_cleanup_job")]
    pub call_cleanup: JobConfig,
    #[serde(default = "default_trial_job")]
    pub trial_expiry: JobConfig,
    #[serde(default = "default_dedup_job")]
    pub conversation_dedup: JobConfig,
}

fn default_campaign_job() -> JobConfig { JobConfig::every(30) }
fn default_reminder_job() -> JobConfig { JobConfig::every(300) }
fn default_call_queue_job() -> JobConfig { JobConfig::every(15) }
fn default_call_cleanup_job() -> JobConfig { JobConfig::every(3600) }
fn default_trial_job() -> JobConfig { JobConfig::every(3600) }
fn default_dedup_job() -> JobConfig { JobConfig::every(900) }

impl JobsConfig {
    pub fn entries(&self) -> [(&'static str, &JobConfig); 6] {
        [
            ("campaigns", &self.campaigns),
            ("lead_reminders", &self.lead_reminders),
            ("call_queue", &self.call_queue),
            ("call_cleanup", &self.call_cleanup),
            ("trial_expiry", &self.trial_expiry),
            ("conversation_dedup", &self.conversation_dedup),
        ]
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            campaigns: default_campaign_job(),
            lead_reminders: default_reminder_job(),
            call_queue: default_call_queue_job(),
            call_cleanup: default_call_cleanup_job(),
            trial_expiry: default_trial_job(),
            conversation_dedup: default_dedup_job(),
        }
    }
}

/// Campaign batching (outbound rate limits).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_batch_delay")]
    pub inter_batch_delay_ms: u64,
}

fn default_batch_size() -> u64 { 50 }
fn default_batch_delay() -> u64 { 1000 }

impl CampaignConfig {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            inter_batch_delay_ms: default_batch_delay(),
        }
    }
}

/// Lead follow-up reminders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    #[serde(default = "default_reminder_channel")]
    pub channel: String,
    #[serde(default = "default_reminder_limit")]
    pub batch_limit: u64,
}

fn default_reminder_channel() -> String { "whatsapp".into() }
fn default_reminder_limit() -> u64 { 200 }

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            channel: default_reminder_channel(),
            batch_limit: default_reminder_limit(),
        }
    }
}

/// Outbound call queue policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallQueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    /// `in_progress` items older than this are treated as interrupted.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Max items dialled per tick.
    #[serde(default = "default_call_batch")]
    pub batch_limit: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_retry_backoff() -> u64 { 300 }
fn default_stale_after() -> u64 { 900 }
fn default_retention_days() -> u64 { 30 }
fn default_call_batch() -> u64 { 20 }

impl Default for CallQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff(),
            stale_after_secs: default_stale_after(),
            retention_days: default_retention_days(),
            batch_limit: default_call_batch(),
        }
    }
}

/// Conversation reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Fallback country hint when a tenant has none configured.
    #[serde(default = "default_country")]
    pub default_country: String,
}

fn default_country() -> String { "+91".into() }

impl Default for DedupConfig {
    fn default() -> Self {
        Self { default_country: default_country() }
    }
}

/// Health/metrics HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 8090 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

/// External collaborator endpoints. Empty URL means dry-run (log only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub notify_webhook_url: String,
    #[serde(default)]
    pub telephony_url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 { 10 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            notify_webhook_url: String::new(),
            telephony_url: String::new(),
            auth_token: String::new(),
            timeout_secs: default_timeout(),
        }
    }
}
