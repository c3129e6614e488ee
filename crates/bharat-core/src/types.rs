//! Domain records shared by the store, the jobs and the health surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CrmError;

/// An isolated customer organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// "trial", "starter", "pro", ...
    pub plan: String,
    /// "active" or "suspended".
    pub status: String,
    pub subscription_end: Option<DateTime<Utc>>,
    /// Country hint used when normalizing this tenant's phone numbers.
    pub default_country: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One ongoing channel of messages with one external contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: String,
    pub tenant_id: String,
    pub owner_user_id: Option<String>,
    pub raw_phone: String,
    /// E.164 form when `phone_normalized`, otherwise the fallback key.
    pub canonical_phone: String,
    pub country_code: Option<String>,
    pub phone_normalized: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(CrmError::store(format!("unknown direction '{other}'"))),
        }
    }
}

/// A single inbound/outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub external_message_id: Option<String>,
    pub direction: Direction,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Call work item lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl CallStatus {
    pub const ALL: [CallStatus; 5] = [
        CallStatus::Queued,
        CallStatus::InProgress,
        CallStatus::Completed,
        CallStatus::Failed,
        CallStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CallStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| CrmError::store(format!("unknown call status '{s}'")))
    }
}

/// One unit of outbound-call work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallWorkItem {
    pub id: String,
    pub tenant_id: String,
    pub target_phone: String,
    pub script: String,
    pub status: CallStatus,
    pub attempts: u32,
    /// Lower number = more urgent.
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub last_error: Option<String>,
    pub transcript: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Campaign status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Scheduled,
    Running,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for CampaignStatus {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "running" => Ok(CampaignStatus::Running),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            other => Err(CrmError::store(format!("unknown campaign status '{other}'"))),
        }
    }
}

/// A bulk outbound send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// Dispatcher channel: "whatsapp", "email", ...
    pub channel: String,
    pub payload: String,
    pub status: CampaignStatus,
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-recipient send status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
        }
    }
}

impl FromStr for RecipientStatus {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecipientStatus::Pending),
            "sent" => Ok(RecipientStatus::Sent),
            "failed" => Ok(RecipientStatus::Failed),
            other => Err(CrmError::store(format!("unknown recipient status '{other}'"))),
        }
    }
}

/// One recipient of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecipient {
    pub id: i64,
    pub campaign_id: String,
    pub recipient: String,
    pub status: RecipientStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// A sales lead with a follow-up date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// Address the reminder goes to (owner's phone or email).
    pub owner_contact: String,
    pub next_follow_up_at: Option<DateTime<Utc>>,
    /// The follow-up timestamp a reminder was already issued for.
    pub reminder_sent_for: Option<DateTime<Utc>>,
    pub last_reminder_error: Option<String>,
    /// When the last failed send happened; cleared once a reminder lands.
    pub last_reminder_attempt_at: Option<DateTime<Utc>>,
}

/// Persisted outcome of the most recent tick of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub job_name: String,
    pub last_tick_at: DateTime<Utc>,
    /// "ran", "skipped", "failed", "panicked", "lease_lost", "aborted".
    pub last_outcome: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub holder: Option<String>,
}

/// Counters from one deduplication pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupSummary {
    pub threads_examined: u64,
    pub canonical_backfilled: u64,
    pub duplicate_groups: u64,
    pub duplicates_found: u64,
    pub messages_moved: u64,
    pub messages_skipped: u64,
    pub threads_deleted: u64,
    pub groups_failed: u64,
}

impl DedupSummary {
    pub fn absorb(&mut self, other: &DedupSummary) {
        self.threads_examined += other.threads_examined;
        self.canonical_backfilled += other.canonical_backfilled;
        self.duplicate_groups += other.duplicate_groups;
        self.duplicates_found += other.duplicates_found;
        self.messages_moved += other.messages_moved;
        self.messages_skipped += other.messages_skipped;
        self.threads_deleted += other.threads_deleted;
        self.groups_failed += other.groups_failed;
    }

    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.canonical_backfilled == 0
            && self.duplicates_found == 0
            && self.messages_moved == 0
            && self.threads_deleted == 0
    }
}

impl fmt::Display for DedupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={} backfilled={} groups={} duplicates={} moved={} skipped={} deleted={} failed_groups={}",
            self.threads_examined,
            self.canonical_backfilled,
            self.duplicate_groups,
            self.duplicates_found,
            self.messages_moved,
            self.messages_skipped,
            self.threads_deleted,
            self.groups_failed
        )
    }
}

/// A stored dedup pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRun {
    pub id: i64,
    /// "scheduled", "operator", "incremental".
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: DedupSummary,
}
