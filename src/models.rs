//! Core data models for the retraining orchestrator

use crate::error::OrchestrationError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Metric names published to the metric store.
pub const METRIC_MODEL_MAPE: &str = "ModelMAPE";
pub const METRIC_MODEL_DRIFT_DETECTED: &str = "ModelDriftDetected";
pub const METRIC_DATA_DRIFT: &str = "DataDrift";

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunVerdict {
    Pending,
    Promoted,
    Rejected,
    Failed,
}

impl RunVerdict {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunVerdict::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TrainingFailure,
    TrainingTimeout,
    InvalidMetric,
    PromotionFailed,
    ServingStateUpdateAmbiguous,
    Cancelled,
    DeadlineExceeded,
    /// PENDING found past its deadline by a later invocation
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Classify an error raised while a run was in flight.
    pub fn from_error(err: &OrchestrationError) -> Self {
        let kind = match err {
            OrchestrationError::InvalidMetric(_) => FailureKind::InvalidMetric,
            OrchestrationError::Cancelled => FailureKind::Cancelled,
            OrchestrationError::DeployError(_) => FailureKind::PromotionFailed,
            _ => FailureKind::TrainingFailure,
        };
        Self::new(kind, err.to_string())
    }
}

//
// ================= Threshold =================
//

/// Promotion threshold on MAPE (percent). A candidate must be strictly below it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
#[serde(transparent)]
pub struct Threshold(f64);

impl Threshold {
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//
// ================= Training Run =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Past this instant a PENDING run is considered abandoned
    pub deadline: DateTime<Utc>,
    pub data_snapshot_ref: String,
    pub baseline_model_ref: String,
    pub baseline_metric: f64,
    pub training_job_id: Option<String>,
    pub candidate_model_ref: Option<String>,
    pub metric_value: Option<f64>,
    #[serde(default)]
    pub auxiliary_metrics: BTreeMap<String, f64>,
    pub verdict: RunVerdict,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl TrainingRun {
    pub fn pending(
        data_snapshot_ref: String,
        baseline: &ServingState,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            deadline,
            data_snapshot_ref,
            baseline_model_ref: baseline.active_model_ref.clone(),
            baseline_metric: baseline.active_model_metric,
            training_job_id: None,
            candidate_model_ref: None,
            metric_value: None,
            auxiliary_metrics: BTreeMap::new(),
            verdict: RunVerdict::Pending,
            failure: None,
            requested_by: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.verdict.is_terminal()
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.verdict == RunVerdict::Pending && now > self.deadline
    }

    fn ensure_pending(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(OrchestrationError::RunFinalized(self.run_id));
        }
        Ok(())
    }

    /// Record the artifact produced by the training job.
    pub fn record_candidate(&mut self, output: &TrainingOutput) -> Result<()> {
        self.ensure_pending()?;
        self.training_job_id = Some(output.job_id.clone());
        self.candidate_model_ref = output.model_ref.clone();
        self.metric_value = output.metric_value;
        self.auxiliary_metrics = output.auxiliary_metrics.clone();
        Ok(())
    }

    fn finish(&mut self, verdict: RunVerdict, failure: Option<FailureReason>) -> Result<()> {
        self.ensure_pending()?;
        self.verdict = verdict;
        self.failure = failure;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_promoted(&mut self) -> Result<()> {
        if self.candidate_model_ref.is_none() {
            return Err(OrchestrationError::InvalidTransition(format!(
                "run {} cannot be promoted without a candidate",
                self.run_id
            )));
        }
        self.finish(RunVerdict::Promoted, None)
    }

    pub fn mark_rejected(&mut self) -> Result<()> {
        self.finish(RunVerdict::Rejected, None)
    }

    pub fn mark_failed(&mut self, reason: FailureReason) -> Result<()> {
        self.finish(RunVerdict::Failed, Some(reason))
    }
}

//
// ================= Serving State =================
//

/// The single record of what is live now.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServingState {
    pub active_model_ref: String,
    pub active_model_metric: f64,
    pub last_updated_at: DateTime<Utc>,
    /// Compare-and-swap token, bumped on every promotion
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub promoted_by_run: Option<Uuid>,
}

impl ServingState {
    pub fn seed(model_ref: impl Into<String>, metric: f64) -> Self {
        Self {
            active_model_ref: model_ref.into(),
            active_model_metric: metric,
            last_updated_at: Utc::now(),
            version: 0,
            promoted_by_run: None,
        }
    }

    /// The state that results from promoting `run`'s candidate over `self`.
    pub fn promote(&self, run: &TrainingRun) -> Result<ServingState> {
        let (Some(model_ref), Some(metric)) = (&run.candidate_model_ref, run.metric_value) else {
            return Err(OrchestrationError::InvalidTransition(format!(
                "run {} has no evaluated candidate",
                run.run_id
            )));
        };

        Ok(ServingState {
            active_model_ref: model_ref.clone(),
            active_model_metric: metric,
            last_updated_at: Utc::now(),
            version: self.version + 1,
            promoted_by_run: Some(run.run_id),
        })
    }
}

//
// ================= Trigger I/O =================
//

/// Payload handed over by the periodic trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerContext {
    #[serde(default)]
    pub data_snapshot_ref: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl TriggerContext {
    pub fn with_snapshot(snapshot_ref: impl Into<String>) -> Self {
        Self {
            data_snapshot_ref: Some(snapshot_ref.into()),
            requested_by: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub run_id: Option<Uuid>,
    pub verdict: Option<RunVerdict>,
    pub metric_value: Option<f64>,
    pub active_model_ref: String,
    pub failure: Option<FailureReason>,
    pub notified: bool,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status != RunStatus::Failed
    }
}

//
// ================= Training Job I/O =================
//

/// What the training job runner reports back once a job completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingOutput {
    pub job_id: String,
    pub model_ref: Option<String>,
    /// Self-reported MAPE
    pub metric_value: Option<f64>,
    #[serde(default)]
    pub auxiliary_metrics: BTreeMap<String, f64>,
}

//
// ================= Observability =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricDatum {
    pub name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl MetricDatum {
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            tags: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }
}

//
// ================= Notifications =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationBody {
    pub run_id: Uuid,
    pub metric_value: Option<f64>,
    pub threshold: f64,
    /// The model that is serving production traffic right now
    pub active_model_ref: String,
    pub candidate_model_ref: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub subject: String,
    pub severity: Severity,
    pub body: NotificationBody,
}

impl Notification {
    /// Human-readable message used by text-only channels.
    pub fn render_text(&self) -> String {
        let metric = self
            .body
            .metric_value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "n/a".into());

        let mut text = format!(
            "[{}] {}\nRun: {}\nCandidate MAPE: {}%\nThreshold: {}%\nActive model: {}",
            self.severity,
            self.subject,
            self.body.run_id,
            metric,
            self.body.threshold,
            self.body.active_model_ref,
        );

        if let Some(candidate) = &self.body.candidate_model_ref {
            text.push_str(&format!("\nCandidate model: {}", candidate));
        }
        if let Some(detail) = &self.body.detail {
            text.push_str(&format!("\nDetail: {}", detail));
        }
        text
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunVerdict::Pending => "PENDING",
            RunVerdict::Promoted => "PROMOTED",
            RunVerdict::Rejected => "REJECTED",
            RunVerdict::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}
