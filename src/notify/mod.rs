//! Operator notifications
//!
//! Delivery is best-effort. Callers log failures and carry on; a lost alert
//! never rolls back a decision that was already applied.

use crate::error::OrchestrationError;
use crate::models::{Notification, Severity};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub mod webhook;
pub use webhook::WebhookSink;

/// Trait for alert delivery channels
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the tracing log
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let text = notification.render_text();
        match notification.severity {
            Severity::Info => info!(run_id = %notification.body.run_id, "{}", text),
            Severity::Warning => warn!(run_id = %notification.body.run_id, "{}", text),
            Severity::Critical => error!(run_id = %notification.body.run_id, "{}", text),
        }
        Ok(())
    }
}

/// Keeps every notification in memory
#[derive(Clone, Default)]
pub struct MemorySink {
    sent: Arc<RwLock<Vec<Notification>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.write().await.push(notification.clone());
        Ok(())
    }
}

/// Sends to every channel. Fails only if all channels failed.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Default for FanoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut failures = Vec::new();

        for sink in &self.sinks {
            if let Err(e) = sink.send(notification).await {
                warn!(sink = sink.name(), error = %e, "Notification channel failed");
                failures.push(format!("{}: {}", sink.name(), e));
            }
        }

        if !self.sinks.is_empty() && failures.len() == self.sinks.len() {
            return Err(OrchestrationError::NotificationError(failures.join("; ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationBody;
    use uuid::Uuid;

    struct BrokenSink;

    #[async_trait]
    impl NotificationSink for BrokenSink {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn send(&self, _notification: &Notification) -> Result<()> {
            Err(OrchestrationError::NotificationError("smtp down".into()))
        }
    }

    fn notification() -> Notification {
        Notification {
            subject: "Model needs manual approval".into(),
            severity: Severity::Warning,
            body: NotificationBody {
                run_id: Uuid::new_v4(),
                metric_value: Some(25.3),
                threshold: 20.0,
                active_model_ref: "model-a".into(),
                candidate_model_ref: Some("model-b".into()),
                detail: None,
            },
        }
    }

    #[tokio::test]
    async fn test_fanout_survives_partial_failure() {
        let memory = MemorySink::new();
        let mut fanout = FanoutSink::new();
        fanout.add_sink(Arc::new(BrokenSink));
        fanout.add_sink(Arc::new(memory.clone()));

        assert!(fanout.send(&notification()).await.is_ok());
        assert_eq!(memory.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fanout_fails_when_every_channel_fails() {
        let mut fanout = FanoutSink::new();
        fanout.add_sink(Arc::new(BrokenSink));
        assert!(fanout.send(&notification()).await.is_err());
    }

    #[tokio::test]
    async fn test_log_sink_accepts_everything() {
        assert!(LogSink.send(&notification()).await.is_ok());
    }
}
