//! Training job runner trait and implementations
//!
//! The forecasting model's training is an opaque external job. A runner
//! launches it and waits until it produced an artifact or failed; the caller
//! bounds the wait with its own timeout.

use crate::error::OrchestrationError;
use crate::models::TrainingOutput;
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub mod http;
pub use http::HttpTrainingJobRunner;

/// Trait for launching training jobs
#[async_trait]
pub trait TrainingJobRunner: Send + Sync {
    async fn launch(
        &self,
        data_snapshot_ref: &str,
        runtime_image_ref: &str,
    ) -> Result<TrainingOutput>;
}

/// One scripted response of the [`ScriptedTrainingJobRunner`]
#[derive(Debug, Clone)]
pub enum ScriptedJob {
    Complete {
        model_ref: Option<String>,
        metric_value: Option<f64>,
        delay: Duration,
    },
    Fail(String),
}

impl ScriptedJob {
    pub fn completes(model_ref: &str, metric_value: f64) -> Self {
        ScriptedJob::Complete {
            model_ref: Some(model_ref.to_string()),
            metric_value: Some(metric_value),
            delay: Duration::ZERO,
        }
    }

    pub fn completes_after(model_ref: &str, metric_value: f64, delay: Duration) -> Self {
        ScriptedJob::Complete {
            model_ref: Some(model_ref.to_string()),
            metric_value: Some(metric_value),
            delay,
        }
    }
}

/// Replays a queue of scripted jobs. Keeps the system runnable without a
/// training service and drives the orchestrator tests.
#[derive(Clone, Default)]
pub struct ScriptedTrainingJobRunner {
    script: Arc<Mutex<VecDeque<ScriptedJob>>>,
    launched: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTrainingJobRunner {
    pub fn new(jobs: Vec<ScriptedJob>) -> Self {
        Self {
            script: Arc::new(Mutex::new(jobs.into())),
            launched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot refs of every launched job, in order
    pub async fn launched(&self) -> Vec<String> {
        self.launched.lock().await.clone()
    }
}

#[async_trait]
impl TrainingJobRunner for ScriptedTrainingJobRunner {
    async fn launch(
        &self,
        data_snapshot_ref: &str,
        _runtime_image_ref: &str,
    ) -> Result<TrainingOutput> {
        let job_number = {
            let mut launched = self.launched.lock().await;
            launched.push(data_snapshot_ref.to_string());
            launched.len()
        };

        let next = self.script.lock().await.pop_front();
        let job_id = format!("scripted-job-{}", job_number);

        match next {
            Some(ScriptedJob::Complete {
                model_ref,
                metric_value,
                delay,
            }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(TrainingOutput {
                    job_id,
                    model_ref,
                    metric_value,
                    auxiliary_metrics: BTreeMap::new(),
                })
            }
            Some(ScriptedJob::Fail(reason)) => Err(OrchestrationError::TrainingFailure(reason)),
            None => Err(OrchestrationError::TrainingFailure(
                "training runner unavailable: no scripted job left".into(),
            )),
        }
    }
}
