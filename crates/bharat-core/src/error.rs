//! Error taxonomy shared by every worker crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CrmError>;

/// All errors raised by the orchestration and reconciliation core.
#[derive(Debug, Error)]
pub enum CrmError {
    /// Configuration could not be read or is invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// Record store unreachable or a query failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Lease store failure (not the same as "busy" or "lost").
    #[error("Lease store error: {0}")]
    Lease(String),

    /// The lease protecting a job body was taken over by another holder.
    #[error("Lease lost for '{key}'")]
    LeaseLost { key: String },

    /// The process is shutting down; the body must stop at this checkpoint.
    #[error("Shutting down")]
    ShuttingDown,

    /// A state transition outside the documented edge set.
    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// A conditional update found the row in a different state than expected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Requested record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Notification dispatcher failure.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Telephony provider failure.
    #[error("Telephony error: {0}")]
    Telephony(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrmError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }

    pub fn telephony(msg: impl Into<String>) -> Self {
        Self::Telephony(msg.into())
    }

    /// Transient infrastructure errors are retried on the next tick and
    /// never surfaced as fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Lease(_) | Self::Dispatch(_) | Self::Telephony(_) | Self::Io(_)
        )
    }

    /// Errors that require the current job body to stop immediately.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::LeaseLost { .. } | Self::ShuttingDown)
    }
}
