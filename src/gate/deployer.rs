//! Endpoint swap collaborators used by the promotion gate

use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    Confirmed,
    /// The swap may or may not have happened
    Indeterminate(String),
}

/// Trait for pointing the production endpoint at a model.
///
/// `Err` means the swap was definitely refused and production is untouched.
#[async_trait]
pub trait ModelDeployer: Send + Sync {
    async fn swap(&self, model_ref: &str) -> Result<SwapOutcome>;
}

/// Confirms every swap. Used when no deployment API is configured.
#[derive(Clone, Default)]
pub struct StaticDeployer {
    deployed: Arc<Mutex<Vec<String>>>,
}

impl StaticDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deployed(&self) -> Vec<String> {
        self.deployed.lock().await.clone()
    }
}

#[async_trait]
impl ModelDeployer for StaticDeployer {
    async fn swap(&self, model_ref: &str) -> Result<SwapOutcome> {
        info!(model_ref = %model_ref, "Endpoint now serving model");
        self.deployed.lock().await.push(model_ref.to_string());
        Ok(SwapOutcome::Confirmed)
    }
}

/// Replays scripted swap results, then confirms.
#[derive(Clone, Default)]
pub struct ScriptedDeployer {
    script: Arc<Mutex<VecDeque<Result<SwapOutcome>>>>,
    attempts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedDeployer {
    pub fn new(outcomes: Vec<Result<SwapOutcome>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(outcomes.into())),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn attempts(&self) -> Vec<String> {
        self.attempts.lock().await.clone()
    }
}

#[async_trait]
impl ModelDeployer for ScriptedDeployer {
    async fn swap(&self, model_ref: &str) -> Result<SwapOutcome> {
        self.attempts.lock().await.push(model_ref.to_string());
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(SwapOutcome::Confirmed))
    }
}

/// Endpoint-management API client.
///
/// `PUT {base}/endpoint` with `{"model_ref": ...}`. A 4xx is a definite
/// refusal; 5xx, timeouts and transport errors leave the outcome unknown.
pub struct HttpEndpointDeployer {
    client: Client,
    base_url: String,
}

impl HttpEndpointDeployer {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ModelDeployer for HttpEndpointDeployer {
    async fn swap(&self, model_ref: &str) -> Result<SwapOutcome> {
        let url = format!("{}/endpoint", self.base_url);

        let response = match self
            .client
            .put(url)
            .json(&json!({ "model_ref": model_ref }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Endpoint update did not return");
                return Ok(SwapOutcome::Indeterminate(format!(
                    "endpoint update request failed: {}",
                    e
                )));
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(SwapOutcome::Confirmed);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(OrchestrationError::DeployError(format!(
                "endpoint update refused with {}: {}",
                status, body
            )));
        }

        Ok(SwapOutcome::Indeterminate(format!(
            "endpoint update returned {}: {}",
            status, body
        )))
    }
}
