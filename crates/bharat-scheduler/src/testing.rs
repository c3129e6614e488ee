//! Recording fakes for the collaborator traits.

use async_trait::async_trait;
use bharat_core::error::{CrmError, Result};
use bharat_core::traits::{CallOutcome, NotificationDispatcher, TelephonyProvider};
use std::collections::HashSet;
use std::sync::Mutex;

/// Records every delivered message; fails for recipients in `fail_for`.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub sent: Mutex<Vec<(String, String, String)>>,
    pub fail_for: HashSet<String>,
    /// After this many deliveries every further send hangs forever.
    pub hang_after: Option<usize>,
}

impl RecordingDispatcher {
    pub fn failing(recipients: &[&str]) -> Self {
        Self {
            fail_for: recipients.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, r, _)| r.clone()).collect()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send(&self, channel: &str, recipient: &str, payload: &str) -> Result<()> {
        if self.fail_for.contains(recipient) {
            return Err(CrmError::dispatch(format!("{recipient} unreachable")));
        }
        let delivered = self.sent.lock().unwrap().len();
        if self.hang_after.is_some_and(|n| delivered >= n) {
            std::future::pending::<()>().await;
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel.to_string(), recipient.to_string(), payload.to_string()));
        Ok(())
    }
}

/// Answers every call, failing numbers in `fail_for`.
#[derive(Default)]
pub struct ScriptedTelephony {
    pub dialled: Mutex<Vec<String>>,
    pub fail_for: HashSet<String>,
}

#[async_trait]
impl TelephonyProvider for ScriptedTelephony {
    async fn place_call(&self, phone_number: &str, _script: &str) -> Result<CallOutcome> {
        self.dialled.lock().unwrap().push(phone_number.to_string());
        if self.fail_for.contains(phone_number) {
            return Err(CrmError::telephony("no answer"));
        }
        Ok(CallOutcome {
            transcript: Some(format!("spoke with {phone_number}")),
        })
    }
}
