//! HTTP client for the training-job service
//!
//! Launches a job, then polls its status until it completes, fails or is
//! stopped. The overall wait is bounded by the orchestrator.

use super::TrainingJobRunner;
use crate::error::OrchestrationError;
use crate::models::TrainingOutput;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    job_id: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "PascalCase")]
enum JobStatus {
    InProgress,
    Completed,
    Failed,
    Stopped,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct JobDescription {
    status: JobStatus,
    #[serde(default)]
    model_ref: Option<String>,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    #[serde(default)]
    failure_reason: Option<String>,
}

pub struct HttpTrainingJobRunner {
    client: Client,
    base_url: String,
    poll_interval: Duration,
    max_runtime: Duration,
}

impl HttpTrainingJobRunner {
    pub fn new(base_url: &str, poll_interval: Duration, max_runtime: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
            max_runtime,
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::TrainingFailure(format!(
                    "training service unreachable at {}: {}",
                    path, e
                ))
            })?;

        Self::read_json(path, response).await
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self.client.get(url).send().await.map_err(|e| {
            OrchestrationError::TrainingFailure(format!(
                "training service unreachable at {}: {}",
                path, e
            ))
        })?;

        Self::read_json(path, response).await
    }

    async fn read_json(path: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestrationError::TrainingFailure(format!(
                "training service returned {} for {}: {}",
                status, path, body
            )));
        }

        response.json::<Value>().await.map_err(|e| {
            OrchestrationError::TrainingFailure(format!("invalid JSON from {}: {}", path, e))
        })
    }
}

/// Job names follow `forecast-retrain-YYYYmmdd-HHMMSS`
pub fn job_name() -> String {
    format!("forecast-retrain-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}

fn into_output(job_id: String, mut description: JobDescription) -> TrainingOutput {
    let metric_value = description.metrics.remove("mape");
    TrainingOutput {
        job_id,
        model_ref: description.model_ref.filter(|r| !r.trim().is_empty()),
        metric_value,
        auxiliary_metrics: description.metrics,
    }
}

#[async_trait]
impl TrainingJobRunner for HttpTrainingJobRunner {
    async fn launch(
        &self,
        data_snapshot_ref: &str,
        runtime_image_ref: &str,
    ) -> Result<TrainingOutput> {
        let name = job_name();
        let body = json!({
            "job_name": name,
            "data_snapshot_ref": data_snapshot_ref,
            "runtime_image_ref": runtime_image_ref,
            "max_runtime_secs": self.max_runtime.as_secs(),
        });

        let launched: LaunchResponse =
            serde_json::from_value(self.post_json("/training-jobs", &body).await?)?;

        info!(job_id = %launched.job_id, job_name = %name, "Training job launched");

        let status_path = format!("/training-jobs/{}", launched.job_id);
        loop {
            let description: JobDescription =
                serde_json::from_value(self.get_json(&status_path).await?)?;

            match description.status {
                JobStatus::Completed => {
                    info!(job_id = %launched.job_id, "Training job completed");
                    return Ok(into_output(launched.job_id, description));
                }
                JobStatus::Failed | JobStatus::Stopped => {
                    return Err(OrchestrationError::TrainingFailure(format!(
                        "job {} ended as {:?}: {}",
                        launched.job_id,
                        description.status,
                        description
                            .failure_reason
                            .unwrap_or_else(|| "no reason reported".into())
                    )));
                }
                JobStatus::InProgress | JobStatus::Unknown => {
                    debug!(job_id = %launched.job_id, "Training job still running");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
