use super::*;
use crate::audit::{serving_state_consistent, verify_chain};
use crate::evaluator::create_default_drift_evaluator;
use crate::gate::{ModelDeployer, ScriptedDeployer, SwapOutcome};
use crate::lock::InProcessRunLock;
use crate::models::Threshold;
use crate::notify::MemorySink;
use crate::runner::{ScriptedJob, ScriptedTrainingJobRunner};
use crate::snapshot::StaticSnapshotSource;
use crate::store::InMemoryMetricStore;
use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};

/// Deployer whose swap takes a while to confirm
#[derive(Clone, Default)]
struct SlowDeployer {
    inner: ScriptedDeployer,
    delay: Duration,
}

#[async_trait]
impl ModelDeployer for SlowDeployer {
    async fn swap(&self, model_ref: &str) -> Result<SwapOutcome> {
        let outcome = self.inner.swap(model_ref).await;
        tokio::time::sleep(self.delay).await;
        outcome
    }
}

struct Harness {
    orchestrator: Arc<RetrainingOrchestrator>,
    store: Arc<InMemoryMetricStore>,
    runner: ScriptedTrainingJobRunner,
    deployer: ScriptedDeployer,
    sink: MemorySink,
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        threshold: Threshold::new(20.0),
        ..OrchestratorSettings::default()
    }
}

fn harness_with(
    settings: OrchestratorSettings,
    snapshots: StaticSnapshotSource,
    jobs: Vec<ScriptedJob>,
    swaps: Vec<Result<SwapOutcome>>,
) -> Harness {
    let store = Arc::new(InMemoryMetricStore::new(ServingState::seed("model-a", 18.0)));
    let runner = ScriptedTrainingJobRunner::new(jobs);
    let deployer = ScriptedDeployer::new(swaps);
    let sink = MemorySink::new();

    let orchestrator = RetrainingOrchestrator::new(
        settings,
        create_default_drift_evaluator(),
        Collaborators {
            snapshots: Box::new(snapshots),
            runner: Box::new(runner.clone()),
            store: store.clone(),
            deployer: Arc::new(deployer.clone()),
            notifier: Arc::new(sink.clone()),
            run_lock: Box::new(InProcessRunLock::new()),
        },
    );

    Harness {
        orchestrator: Arc::new(orchestrator),
        store,
        runner,
        deployer,
        sink,
    }
}

fn harness(jobs: Vec<ScriptedJob>) -> Harness {
    harness_with(
        settings(),
        StaticSnapshotSource::new("bronze/sales-2024-06.csv"),
        jobs,
        vec![],
    )
}

fn failure_kind(result: &RunResult) -> Option<FailureKind> {
    result.failure.as_ref().map(|f| f.kind)
}

#[tokio::test]
async fn test_rejected_candidate_notifies_and_keeps_model() {
    let h = harness(vec![ScriptedJob::completes("model-b", 25.3)]);
    let before = h.store.read_serving_state().await.unwrap();

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.verdict, Some(RunVerdict::Rejected));
    assert_eq!(result.metric_value, Some(25.3));
    assert_eq!(result.active_model_ref, "model-a");
    assert!(result.notified);

    let sent = h.sink.sent().await;
    assert_eq!(sent.len(), 1);
    let text = sent[0].render_text();
    assert!(text.contains("25.3"));
    assert!(text.contains("model-a"));

    assert_eq!(h.store.read_serving_state().await.unwrap(), before);
    assert!(h.deployer.attempts().await.is_empty());
}

#[tokio::test]
async fn test_accepted_candidate_is_promoted_silently() {
    let h = harness(vec![ScriptedJob::completes("model-b", 12.0)]);

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.verdict, Some(RunVerdict::Promoted));
    assert_eq!(result.active_model_ref, "model-b");
    assert!(!result.notified);
    assert!(h.sink.sent().await.is_empty());

    let state = h.store.read_serving_state().await.unwrap();
    assert_eq!(state.active_model_ref, "model-b");
    assert_eq!(state.active_model_metric, 12.0);
    assert_eq!(state.promoted_by_run, result.run_id);
    assert_eq!(h.deployer.attempts().await, vec!["model-b"]);
}

#[tokio::test]
async fn test_metric_equal_to_threshold_is_rejected() {
    let h = harness(vec![ScriptedJob::completes("model-b", 20.0)]);

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(result.verdict, Some(RunVerdict::Rejected));
    assert_eq!(h.store.read_serving_state().await.unwrap().active_model_ref, "model-a");
}

#[tokio::test]
async fn test_training_timeout_fails_run() {
    let h = harness_with(
        OrchestratorSettings {
            max_run_duration: Duration::from_millis(50),
            ..settings()
        },
        StaticSnapshotSource::new("bronze/sales-2024-06.csv"),
        vec![ScriptedJob::completes_after("model-b", 5.0, Duration::from_secs(5))],
        vec![],
    );
    let before = h.store.read_serving_state().await.unwrap();

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.verdict, Some(RunVerdict::Failed));
    assert_eq!(failure_kind(&result), Some(FailureKind::TrainingTimeout));
    assert_eq!(h.store.read_serving_state().await.unwrap(), before);

    let runs = h.store.list_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].verdict, RunVerdict::Failed);
    assert!(runs[0].finished_at.is_some());
}

#[tokio::test]
async fn test_ambiguous_swap_escalates_and_keeps_known_model() {
    let h = harness_with(
        settings(),
        StaticSnapshotSource::new("bronze/sales-2024-06.csv"),
        vec![ScriptedJob::completes("model-b", 11.0)],
        vec![Ok(SwapOutcome::Indeterminate("endpoint update timed out".into()))],
    );

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(failure_kind(&result), Some(FailureKind::ServingStateUpdateAmbiguous));

    let sent = h.sink.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].severity, Severity::Critical);

    let state = h.store.read_serving_state().await.unwrap();
    assert!(["model-a", "model-b"].contains(&state.active_model_ref.as_str()));
}

#[tokio::test]
async fn test_concurrent_trigger_is_rejected() {
    let h = harness(vec![
        ScriptedJob::completes_after("model-b", 12.0, Duration::from_millis(200)),
        ScriptedJob::completes("model-c", 10.0),
    ]);

    let (first, second) = tokio::join!(
        h.orchestrator.run(TriggerContext::default()),
        h.orchestrator.run(TriggerContext::default())
    );

    let results = [first, second];
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(OrchestrationError::ConcurrentRunRejected(_))))
        .count();
    let completed = results.iter().filter(|r| r.is_ok()).count();

    assert_eq!(rejected, 1);
    assert_eq!(completed, 1);
    assert_eq!(h.store.list_runs().await.unwrap().len(), 1);
    assert_eq!(h.runner.launched().await.len(), 1);
}

#[tokio::test]
async fn test_lock_is_released_after_run() {
    let h = harness(vec![
        ScriptedJob::completes("model-b", 25.0),
        ScriptedJob::completes("model-c", 10.0),
    ]);

    assert_ok!(h.orchestrator.run(TriggerContext::default()).await);
    let second = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(second.verdict, Some(RunVerdict::Promoted));
    assert_eq!(h.store.list_runs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancel_stops_training() {
    let h = harness(vec![ScriptedJob::completes_after(
        "model-b",
        12.0,
        Duration::from_secs(5),
    )]);

    let orchestrator = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.run(TriggerContext::default()).await });

    let mut waited = 0;
    while h.orchestrator.active_run_id().is_none() && waited < 100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert!(h.orchestrator.cancel_active_run());

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(failure_kind(&result), Some(FailureKind::Cancelled));
    assert!(h.sink.sent().await.is_empty());
    assert_eq!(h.store.read_serving_state().await.unwrap().active_model_ref, "model-a");
    assert!(!h.orchestrator.cancel_active_run());
}

#[tokio::test]
async fn test_detached_run_finishes_promotion_after_caller_leaves() {
    let store = Arc::new(InMemoryMetricStore::new(ServingState::seed("model-a", 18.0)));
    let deployer = SlowDeployer {
        inner: ScriptedDeployer::default(),
        delay: Duration::from_millis(200),
    };
    let sink = MemorySink::new();
    let orchestrator = Arc::new(RetrainingOrchestrator::new(
        settings(),
        create_default_drift_evaluator(),
        Collaborators {
            snapshots: Box::new(StaticSnapshotSource::new("bronze/sales-2024-06.csv")),
            runner: Box::new(ScriptedTrainingJobRunner::new(vec![ScriptedJob::completes(
                "model-b", 12.0,
            )])),
            store: store.clone(),
            deployer: Arc::new(deployer.clone()),
            notifier: Arc::new(sink.clone()),
            run_lock: Box::new(InProcessRunLock::new()),
        },
    ));

    // Caller gives up while the endpoint swap is in flight
    let dropped = tokio::time::timeout(
        Duration::from_millis(60),
        orchestrator.clone().run_detached(TriggerContext::default()),
    )
    .await;
    assert!(dropped.is_err());

    let mut waited = 0;
    while orchestrator.active_run_id().is_some() && waited < 100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
    }

    let runs = store.list_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].verdict, RunVerdict::Promoted);
    assert_eq!(deployer.inner.attempts().await, vec!["model-b"]);

    let state = store.read_serving_state().await.unwrap();
    assert_eq!(state.active_model_ref, "model-b");
    assert_eq!(state.promoted_by_run, Some(runs[0].run_id));
    assert!(sink.sent().await.is_empty());
}

#[tokio::test]
async fn test_dropped_run_releases_active_slot_and_lock() {
    let h = harness(vec![
        ScriptedJob::completes_after("model-b", 12.0, Duration::from_secs(5)),
        ScriptedJob::completes("model-c", 25.0),
    ]);

    let dropped = tokio::time::timeout(
        Duration::from_millis(50),
        h.orchestrator.run(TriggerContext::default()),
    )
    .await;
    assert!(dropped.is_err());

    assert!(h.orchestrator.active_run_id().is_none());
    assert!(!h.orchestrator.cancel_active_run());

    let next = h.orchestrator.run(TriggerContext::default()).await.unwrap();
    assert_eq!(next.verdict, Some(RunVerdict::Rejected));
}

#[tokio::test]
async fn test_stale_pending_run_is_reaped() {
    let h = harness(vec![ScriptedJob::completes("model-b", 25.0)]);

    let seed = h.store.read_serving_state().await.unwrap();
    let abandoned = TrainingRun::pending(
        "bronze/old.csv".into(),
        &seed,
        Utc::now() - chrono::Duration::minutes(1),
    );
    h.store.append_run(&abandoned).await.unwrap();

    assert_ok!(h.orchestrator.run(TriggerContext::default()).await);

    let reaped = h.store.load_run(abandoned.run_id).await.unwrap().unwrap();
    assert_eq!(reaped.verdict, RunVerdict::Failed);
    assert_eq!(reaped.failure.map(|f| f.kind), Some(FailureKind::Abandoned));
}

#[tokio::test]
async fn test_missing_snapshot_creates_no_run() {
    let h = harness_with(
        settings(),
        StaticSnapshotSource::empty(),
        vec![ScriptedJob::completes("model-b", 12.0)],
        vec![],
    );

    let err = h.orchestrator.run(TriggerContext::default()).await;

    assert!(matches!(err, Err(OrchestrationError::SnapshotUnavailable(_))));
    assert!(h.store.list_runs().await.unwrap().is_empty());
    assert!(h.runner.launched().await.is_empty());
}

#[tokio::test]
async fn test_trigger_snapshot_overrides_source() {
    let h = harness(vec![ScriptedJob::completes("model-b", 25.0)]);

    let result = h
        .orchestrator
        .run(TriggerContext::with_snapshot("bronze/backfill.csv"))
        .await
        .unwrap();

    assert_eq!(h.runner.launched().await, vec!["bronze/backfill.csv"]);
    let run = h.store.load_run(result.run_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(run.data_snapshot_ref, "bronze/backfill.csv");
}

#[tokio::test]
async fn test_unchanged_snapshot_is_skipped() {
    let h = harness_with(
        OrchestratorSettings {
            skip_if_unchanged: true,
            ..settings()
        },
        StaticSnapshotSource::new("bronze/sales-2024-06.csv"),
        vec![
            ScriptedJob::completes("model-b", 25.0),
            ScriptedJob::completes("model-c", 10.0),
        ],
        vec![],
    );

    let first = h.orchestrator.run(TriggerContext::default()).await.unwrap();
    let second = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Skipped);
    assert!(second.run_id.is_none());
    assert!(second.is_success());
    assert_eq!(h.runner.launched().await.len(), 1);
}

#[tokio::test]
async fn test_training_failure_is_recorded() {
    let h = harness(vec![ScriptedJob::Fail("job status Failed".into())]);

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(failure_kind(&result), Some(FailureKind::TrainingFailure));
    assert!(result.notified);
    assert_eq!(h.sink.sent().await[0].severity, Severity::Warning);
    assert_eq!(h.store.read_serving_state().await.unwrap().active_model_ref, "model-a");
}

#[tokio::test]
async fn test_training_failure_notification_can_be_disabled() {
    let h = harness_with(
        OrchestratorSettings {
            notify_on_training_failure: false,
            ..settings()
        },
        StaticSnapshotSource::new("bronze/sales-2024-06.csv"),
        vec![ScriptedJob::Fail("out of memory".into())],
        vec![],
    );

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(!result.notified);
    assert!(h.sink.sent().await.is_empty());
}

#[tokio::test]
async fn test_missing_metric_is_invalid() {
    let h = harness(vec![ScriptedJob::Complete {
        model_ref: Some("model-b".into()),
        metric_value: None,
        delay: Duration::ZERO,
    }]);

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(failure_kind(&result), Some(FailureKind::InvalidMetric));
    assert!(h.deployer.attempts().await.is_empty());
}

#[tokio::test]
async fn test_missing_artifact_is_training_failure() {
    let h = harness(vec![ScriptedJob::Complete {
        model_ref: None,
        metric_value: Some(12.0),
        delay: Duration::ZERO,
    }]);

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(failure_kind(&result), Some(FailureKind::TrainingFailure));
    assert_eq!(h.store.read_serving_state().await.unwrap().active_model_ref, "model-a");
}

#[tokio::test]
async fn test_negative_metric_is_invalid() {
    let h = harness(vec![ScriptedJob::completes("model-b", -4.0)]);

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(failure_kind(&result), Some(FailureKind::InvalidMetric));
    assert_eq!(h.store.read_serving_state().await.unwrap().active_model_ref, "model-a");
}

#[tokio::test]
async fn test_refused_promotion_keeps_old_model() {
    let h = harness_with(
        settings(),
        StaticSnapshotSource::new("bronze/sales-2024-06.csv"),
        vec![ScriptedJob::completes("model-b", 11.0)],
        vec![Err(OrchestrationError::DeployError("endpoint quota exceeded".into()))],
    );

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();

    assert_eq!(failure_kind(&result), Some(FailureKind::PromotionFailed));
    assert_eq!(result.active_model_ref, "model-a");
    assert_eq!(h.sink.sent().await.len(), 1);
}

#[tokio::test]
async fn test_run_sequence_keeps_log_and_serving_state_consistent() {
    let h = harness(vec![
        ScriptedJob::completes("model-b", 12.0),
        ScriptedJob::completes("model-c", 25.0),
        ScriptedJob::Fail("spot instance reclaimed".into()),
        ScriptedJob::completes("model-d", 9.0),
    ]);

    for _ in 0..4 {
        assert_ok!(h.orchestrator.run(TriggerContext::default()).await);
    }

    let entries = h.store.run_log().await.unwrap();
    let state = h.store.read_serving_state().await.unwrap();

    assert!(verify_chain(&entries));
    assert!(serving_state_consistent(&entries, &state, "model-a"));
    assert_eq!(state.active_model_ref, "model-d");
    assert_eq!(state.version, 2);

    let runs = h.store.list_runs().await.unwrap();
    assert_eq!(runs.len(), 4);
    assert!(runs.iter().all(|r| r.is_terminal()));
}

#[tokio::test]
async fn test_decided_run_cannot_be_reappended() {
    let h = harness(vec![ScriptedJob::completes("model-b", 12.0)]);

    let result = h.orchestrator.run(TriggerContext::default()).await.unwrap();
    let run = h.store.load_run(result.run_id.unwrap()).await.unwrap().unwrap();

    assert_err!(h.store.append_run(&run).await);
}
