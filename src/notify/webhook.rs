//! Webhook notification channel (Slack-compatible `text` payload plus
//! structured fields)

use super::NotificationSink;
use crate::error::OrchestrationError;
use crate::models::Notification;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

pub fn webhook_payload(notification: &Notification) -> Value {
    json!({
        "text": notification.render_text(),
        "subject": notification.subject,
        "severity": notification.severity,
        "fields": notification.body,
    })
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&webhook_payload(notification))
            .send()
            .await
            .map_err(|e| OrchestrationError::NotificationError(format!("webhook unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestrationError::NotificationError(format!(
                "webhook returned {}",
                status
            )));
        }
        Ok(())
    }
}
