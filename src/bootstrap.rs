//! Wires configured collaborators into a [`RetrainingOrchestrator`]
//!
//! Every external dependency has a local fallback, so the binaries run with
//! nothing but defaults.

use crate::config::RetrainConfig;
use crate::evaluator::create_default_drift_evaluator;
use crate::gate::{HttpEndpointDeployer, ModelDeployer, StaticDeployer};
use crate::lock::{InProcessRunLock, PostgresRunLock, RunLock};
use crate::models::ServingState;
use crate::notify::{FanoutSink, LogSink, WebhookSink};
use crate::orchestrator::{Collaborators, RetrainingOrchestrator};
use crate::runner::{HttpTrainingJobRunner, ScriptedTrainingJobRunner, TrainingJobRunner};
use crate::snapshot::{DirectorySnapshotSource, SnapshotSource, StaticSnapshotSource};
use crate::store::{InMemoryMetricStore, MetricStore, PostgresMetricStore};
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub fn build_orchestrator(config: &RetrainConfig) -> Result<RetrainingOrchestrator> {
    let seed = ServingState::seed(config.seed_model_ref.clone(), config.seed_model_metric);

    let (store, run_lock): (Arc<dyn MetricStore>, Box<dyn RunLock>) = match &config.database_url {
        Some(url) => {
            info!("Using Postgres metric store");
            let store = PostgresMetricStore::connect_lazy(url, seed)?;
            let lock = PostgresRunLock::new(store.pool());
            (Arc::new(store), Box::new(lock))
        }
        None => {
            warn!("DATABASE_URL not set, run log and serving state are kept in memory");
            (
                Arc::new(InMemoryMetricStore::new(seed)),
                Box::new(InProcessRunLock::new()),
            )
        }
    };

    let snapshots: Box<dyn SnapshotSource> = match (&config.data_snapshot_ref, &config.data_snapshot_dir) {
        (Some(snapshot_ref), _) => Box::new(StaticSnapshotSource::new(snapshot_ref.clone())),
        (None, Some(dir)) => {
            info!(dir = %dir.display(), "Resolving snapshots from directory");
            Box::new(DirectorySnapshotSource::new(dir.clone()))
        }
        (None, None) => {
            warn!("No snapshot source configured, triggers must name a snapshot");
            Box::new(StaticSnapshotSource::empty())
        }
    };

    let runner: Box<dyn TrainingJobRunner> = match &config.training_api_url {
        Some(url) => Box::new(HttpTrainingJobRunner::new(
            url,
            config.poll_interval,
            config.settings.max_run_duration,
        )?),
        None => {
            warn!("TRAINING_API_URL not set, training jobs will fail");
            Box::new(ScriptedTrainingJobRunner::new(Vec::new()))
        }
    };

    let deployer: Arc<dyn ModelDeployer> = match &config.deployer_api_url {
        Some(url) => Arc::new(HttpEndpointDeployer::new(url)?),
        None => Arc::new(StaticDeployer::new()),
    };

    let mut notifier = FanoutSink::new();
    notifier.add_sink(Arc::new(LogSink));
    if let Some(url) = &config.alert_webhook_url {
        notifier.add_sink(Arc::new(WebhookSink::new(url)?));
    }
    info!(channels = notifier.len(), "Notification channels ready");

    Ok(RetrainingOrchestrator::new(
        config.settings.clone(),
        create_default_drift_evaluator(),
        Collaborators {
            snapshots,
            runner,
            store,
            deployer,
            notifier: Arc::new(notifier),
            run_lock,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TriggerContext;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_defaults_build_an_in_memory_orchestrator() {
        let map: HashMap<&str, &str> = HashMap::from([("SEED_MODEL_REF", "model-a")]);
        let config = RetrainConfig::from_lookup(|k| map.get(k).map(|v| v.to_string())).unwrap();

        let orchestrator = build_orchestrator(&config).unwrap();
        let state = orchestrator.store().read_serving_state().await.unwrap();
        assert_eq!(state.active_model_ref, "model-a");

        // Without a training service the run is recorded as failed
        let result = orchestrator
            .run(TriggerContext::with_snapshot("bronze/a.csv"))
            .await
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(orchestrator.store().list_runs().await.unwrap().len(), 1);
    }
}
