//! HTTP implementations of the collaborator traits, plus dry-run variants
//! that only log (used when no endpoint is configured).

use async_trait::async_trait;
use bharat_core::config::DispatchConfig;
use bharat_core::error::{CrmError, Result};
use bharat_core::traits::{CallOutcome, NotificationDispatcher, TelephonyProvider};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Posts `{channel, recipient, payload}` to a messaging gateway webhook.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
    auth_token: String,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(url: &str, auth_token: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            auth_token: auth_token.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn send(&self, channel: &str, recipient: &str, payload: &str) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "channel": channel,
                "recipient": recipient,
                "payload": payload,
            }))
            .timeout(self.timeout);
        if !self.auth_token.is_empty() {
            req = req.bearer_auth(&self.auth_token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CrmError::dispatch(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!("✅ {channel} message sent to {recipient}");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(CrmError::dispatch(format!("Webhook error {status}: {body}")))
        }
    }
}

/// Logs instead of sending.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn send(&self, channel: &str, recipient: &str, payload: &str) -> Result<()> {
        tracing::info!("📢 [dry-run] {channel} → {recipient}: {payload}");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CallResponse {
    #[serde(default)]
    transcript: Option<String>,
}

/// Asks a telephony bridge to place a call and waits for its result.
pub struct HttpTelephonyProvider {
    client: reqwest::Client,
    url: String,
    auth_token: String,
    timeout: Duration,
}

impl HttpTelephonyProvider {
    pub fn new(url: &str, auth_token: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            auth_token: auth_token.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl TelephonyProvider for HttpTelephonyProvider {
    async fn place_call(&self, phone_number: &str, script: &str) -> Result<CallOutcome> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "to": phone_number, "script": script }))
            .timeout(self.timeout);
        if !self.auth_token.is_empty() {
            req = req.bearer_auth(&self.auth_token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CrmError::telephony(format!("Call request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CrmError::telephony(format!("Telephony error {status}: {body}")));
        }
        let parsed: CallResponse = resp
            .json()
            .await
            .map_err(|e| CrmError::telephony(format!("Bad telephony response: {e}")))?;
        Ok(CallOutcome {
            transcript: parsed.transcript,
        })
    }
}

/// Logs instead of dialling.
#[derive(Debug, Default)]
pub struct LogTelephony;

#[async_trait]
impl TelephonyProvider for LogTelephony {
    async fn place_call(&self, phone_number: &str, _script: &str) -> Result<CallOutcome> {
        tracing::info!("📞 [dry-run] call to {phone_number}");
        Ok(CallOutcome::default())
    }
}

/// Webhook dispatcher when a URL is configured, otherwise dry-run.
pub fn dispatcher_from_config(config: &DispatchConfig) -> Arc<dyn NotificationDispatcher> {
    if config.notify_webhook_url.is_empty() {
        tracing::warn!("⚠️ No notify webhook configured, messages are only logged");
        Arc::new(LogDispatcher)
    } else {
        Arc::new(WebhookDispatcher::new(
            &config.notify_webhook_url,
            &config.auth_token,
            Duration::from_secs(config.timeout_secs),
        ))
    }
}

/// HTTP telephony when a URL is configured, otherwise dry-run.
pub fn telephony_from_config(config: &DispatchConfig) -> Arc<dyn TelephonyProvider> {
    if config.telephony_url.is_empty() {
        tracing::warn!("⚠️ No telephony endpoint configured, calls are only logged");
        Arc::new(LogTelephony)
    } else {
        Arc::new(HttpTelephonyProvider::new(
            &config.telephony_url,
            &config.auth_token,
            Duration::from_secs(config.timeout_secs),
        ))
    }
}
