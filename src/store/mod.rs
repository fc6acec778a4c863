//! Metric store
//!
//! Append-only run log, the single `ServingState` record and published
//! metric data points. In-memory by default; Postgres when configured.

use crate::audit::{self, RunLogEntry, GENESIS_DIGEST};
use crate::error::OrchestrationError;
use crate::models::{MetricDatum, ServingState, TrainingRun};
use crate::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod postgres;
pub use postgres::PostgresMetricStore;

/// Trait for the durable record of runs, serving state and metrics
#[async_trait::async_trait]
pub trait MetricStore: Send + Sync {
    /// Append a new version of `run`. Fails once the run is terminal.
    async fn append_run(&self, run: &TrainingRun) -> Result<u64>;

    async fn run_log(&self) -> Result<Vec<RunLogEntry>>;

    async fn read_serving_state(&self) -> Result<ServingState>;

    /// Replace the serving state iff its version still equals `expected_version`.
    /// Returns false when another writer got there first.
    async fn compare_and_swap_serving_state(
        &self,
        expected_version: u64,
        next: &ServingState,
    ) -> Result<bool>;

    async fn publish_metric(&self, datum: MetricDatum) -> Result<()>;

    async fn metrics(&self, name: &str) -> Result<Vec<MetricDatum>>;

    async fn load_run(&self, run_id: Uuid) -> Result<Option<TrainingRun>> {
        let log = self.run_log().await?;
        Ok(log
            .into_iter()
            .rev()
            .find(|e| e.run.run_id == run_id)
            .map(|e| e.run))
    }

    async fn list_runs(&self) -> Result<Vec<TrainingRun>> {
        let log = self.run_log().await?;
        Ok(audit::latest_runs(&log))
    }
}

/// In-memory metric store for development and tests
pub struct InMemoryMetricStore {
    log: Arc<RwLock<Vec<RunLogEntry>>>,
    serving_state: Arc<RwLock<ServingState>>,
    metrics: Arc<RwLock<Vec<MetricDatum>>>,
}

impl InMemoryMetricStore {
    pub fn new(seed: ServingState) -> Self {
        Self {
            log: Arc::new(RwLock::new(Vec::new())),
            serving_state: Arc::new(RwLock::new(seed)),
            metrics: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

#[async_trait::async_trait]
impl MetricStore for InMemoryMetricStore {
    async fn append_run(&self, run: &TrainingRun) -> Result<u64> {
        let mut log = self.log.write().await;

        let previous = log.iter().rev().find(|e| e.run.run_id == run.run_id);
        if previous.map(|e| e.run.is_terminal()).unwrap_or(false) {
            return Err(OrchestrationError::RunFinalized(run.run_id));
        }

        let prev_digest = log
            .last()
            .map(|e| e.digest.clone())
            .unwrap_or_else(|| GENESIS_DIGEST.to_string());
        let seq = log.len() as u64 + 1;

        log.push(RunLogEntry::new(seq, run.clone(), &prev_digest));
        Ok(seq)
    }

    async fn run_log(&self) -> Result<Vec<RunLogEntry>> {
        let log = self.log.read().await;
        Ok(log.clone())
    }

    async fn read_serving_state(&self) -> Result<ServingState> {
        let state = self.serving_state.read().await;
        Ok(state.clone())
    }

    async fn compare_and_swap_serving_state(
        &self,
        expected_version: u64,
        next: &ServingState,
    ) -> Result<bool> {
        let mut state = self.serving_state.write().await;
        if state.version != expected_version {
            return Ok(false);
        }
        *state = next.clone();
        Ok(true)
    }

    async fn publish_metric(&self, datum: MetricDatum) -> Result<()> {
        let mut metrics = self.metrics.write().await;
        metrics.push(datum);
        Ok(())
    }

    async fn metrics(&self, name: &str) -> Result<Vec<MetricDatum>> {
        let metrics = self.metrics.read().await;
        Ok(metrics.iter().filter(|m| m.name == name).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunVerdict, METRIC_MODEL_MAPE};
    use chrono::{Duration, Utc};
    use tokio_test::{assert_err, assert_ok};

    fn store() -> InMemoryMetricStore {
        InMemoryMetricStore::new(ServingState::seed("seed-model", 40.0))
    }

    fn pending(state: &ServingState) -> TrainingRun {
        TrainingRun::pending("snap".into(), state, Utc::now() + Duration::minutes(1))
    }

    #[tokio::test]
    async fn test_append_keeps_every_version() {
        let store = store();
        let state = store.read_serving_state().await.unwrap();
        let mut run = pending(&state);

        assert_ok!(store.append_run(&run).await);
        run.mark_rejected().unwrap();
        assert_ok!(store.append_run(&run).await);

        let log = store.run_log().await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(audit::verify_chain(&log));

        let latest = store.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(latest.verdict, RunVerdict::Rejected);
        assert_eq!(store.list_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_run_is_not_appended_again() {
        let store = store();
        let state = store.read_serving_state().await.unwrap();
        let mut run = pending(&state);
        run.mark_rejected().unwrap();

        assert_ok!(store.append_run(&run).await);
        assert_err!(store.append_run(&run).await);
        assert_eq!(store.run_log().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_version() {
        let store = store();
        let state = store.read_serving_state().await.unwrap();

        let mut next = state.clone();
        next.active_model_ref = "model-b".into();
        next.version = 1;

        assert!(store.compare_and_swap_serving_state(0, &next).await.unwrap());
        assert!(!store.compare_and_swap_serving_state(0, &next).await.unwrap());
        assert_eq!(
            store.read_serving_state().await.unwrap().active_model_ref,
            "model-b"
        );
    }

    #[tokio::test]
    async fn test_metrics_filtered_by_name() {
        let store = store();
        store
            .publish_metric(MetricDatum::new(METRIC_MODEL_MAPE, 12.0).tag("model_ref", "m"))
            .await
            .unwrap();
        store
            .publish_metric(MetricDatum::new("Other", 1.0))
            .await
            .unwrap();

        let mape = store.metrics(METRIC_MODEL_MAPE).await.unwrap();
        assert_eq!(mape.len(), 1);
        assert_eq!(mape[0].tags.get("model_ref").map(String::as_str), Some("m"));
    }
}
