//! Notification delivery

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::{info, warn};

use crate::domain::process::{EngineError, Notification, Notifier};

type HmacSha256 = Hmac<Sha256>;

/// Writes notifications to the log
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), EngineError> {
        info!(
            kind = notification.kind.as_str(),
            instance_id = %notification.instance_id,
            node_id = %notification.node_id,
            recipients = ?notification.recipients,
            subject = %notification.subject,
            "Notification"
        );
        Ok(())
    }
}

/// POSTs notifications as JSON to a webhook, signed when a secret is set
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    secret: Option<String>,
    http_client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> Result<Self, EngineError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::notification(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            secret,
            http_client,
        })
    }

    /// HMAC-SHA256 of the payload, hex encoded
    fn sign(secret: &str, payload: &str) -> Result<String, EngineError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| EngineError::notification(format!("Invalid signing key: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), EngineError> {
        let payload = serde_json::to_string(&notification)
            .map_err(|e| EngineError::notification(format!("Failed to serialize payload: {}", e)))?;

        let mut request = self
            .http_client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Flow-Event", notification.kind.as_str())
            .header("X-Flow-Instance", notification.instance_id.as_str());

        if let Some(secret) = &self.secret {
            request = request.header("X-Webhook-Signature", format!("sha256={}", Self::sign(secret, &payload)?));
        }

        let response = request.body(payload).send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                "Request timed out".to_string()
            } else if e.is_connect() {
                "Connection failed".to_string()
            } else {
                format!("Request failed: {}", e)
            };
            EngineError::notification(reason)
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                url = %self.url,
                status = status.as_u16(),
                "Notification webhook answered with an error"
            );
            return Err(EngineError::notification(format!("HTTP status {}", status.as_u16())));
        }

        Ok(())
    }
}
