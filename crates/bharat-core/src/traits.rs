//! External collaborator contracts. The transport behind them (WhatsApp
//! Cloud API, SMTP, a SIP trunk) lives outside this repository.

use async_trait::async_trait;

use crate::error::Result;

/// Sends one notification to one recipient.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// `channel` is "whatsapp", "email", "sms", ...; `recipient` is the
    /// channel address; `payload` the rendered body.
    async fn send(&self, channel: &str, recipient: &str, payload: &str) -> Result<()>;
}

/// Result of a completed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOutcome {
    pub transcript: Option<String>,
}

/// Places one outbound phone call.
#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    async fn place_call(&self, phone_number: &str, script: &str) -> Result<CallOutcome>;
}
