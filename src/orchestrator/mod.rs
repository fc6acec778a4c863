//! Retraining orchestrator - one invocation per trigger
//!
//! LOCK → RESOLVE SNAPSHOT → RECORD PENDING → TRAIN → EVALUATE → GATE → RECORD → NOTIFY

use crate::config::OrchestratorSettings;
use crate::error::OrchestrationError;
use crate::evaluator::{Candidate, DriftEvaluator};
use crate::gate::{build_notification, ModelDeployer, PromotionGate};
use crate::lock::RunLock;
use crate::models::{
    FailureKind, FailureReason, Notification, RunResult, RunStatus, RunVerdict, ServingState,
    Severity, TrainingOutput, TrainingRun, TriggerContext,
};
use crate::notify::NotificationSink;
use crate::runner::TrainingJobRunner;
use crate::snapshot::SnapshotSource;
use crate::store::MetricStore;
use crate::Result;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(test)]
mod tests;

/// External collaborators of the orchestrator
pub struct Collaborators {
    pub snapshots: Box<dyn SnapshotSource>,
    pub runner: Box<dyn TrainingJobRunner>,
    pub store: Arc<dyn MetricStore>,
    pub deployer: Arc<dyn ModelDeployer>,
    pub notifier: Arc<dyn NotificationSink>,
    pub run_lock: Box<dyn RunLock>,
}

struct ActiveRun {
    run_id: Option<Uuid>,
    cancel: CancellationToken,
}

/// Empties the active slot when the invocation ends, including when its
/// future is dropped.
struct ActiveSlotGuard<'a> {
    slot: &'a Mutex<Option<ActiveRun>>,
}

impl Drop for ActiveSlotGuard<'_> {
    fn drop(&mut self) {
        *lock_slot(self.slot) = None;
    }
}

fn lock_slot(slot: &Mutex<Option<ActiveRun>>) -> MutexGuard<'_, Option<ActiveRun>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Coordinates a single retraining attempt from trigger to verdict
pub struct RetrainingOrchestrator {
    settings: OrchestratorSettings,
    snapshots: Box<dyn SnapshotSource>,
    runner: Box<dyn TrainingJobRunner>,
    evaluator: DriftEvaluator,
    gate: PromotionGate,
    store: Arc<dyn MetricStore>,
    notifier: Arc<dyn NotificationSink>,
    run_lock: Box<dyn RunLock>,
    active: Mutex<Option<ActiveRun>>,
}

impl RetrainingOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        evaluator: DriftEvaluator,
        parts: Collaborators,
    ) -> Self {
        let gate = PromotionGate::new(
            parts.store.clone(),
            parts.deployer,
            settings.notify_on_promotion,
        );

        Self {
            settings,
            snapshots: parts.snapshots,
            runner: parts.runner,
            evaluator,
            gate,
            store: parts.store,
            notifier: parts.notifier,
            run_lock: parts.run_lock,
            active: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn store(&self) -> Arc<dyn MetricStore> {
        self.store.clone()
    }

    /// Run id of the in-flight run, if one got far enough to create it
    pub fn active_run_id(&self) -> Option<Uuid> {
        lock_slot(&self.active).as_ref().and_then(|a| a.run_id)
    }

    /// Ask the in-flight run to stop. Returns false when nothing is running.
    pub fn cancel_active_run(&self) -> bool {
        match lock_slot(&self.active).as_ref() {
            Some(active) => {
                warn!(run_id = ?active.run_id, "Cancellation requested");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute one invocation on its own task.
    ///
    /// The run keeps going when the caller's future is dropped (e.g. an HTTP
    /// client disconnecting), so a promotion is never cut between the
    /// endpoint swap and the serving-state write.
    pub async fn run_detached(self: Arc<Self>, trigger: TriggerContext) -> Result<RunResult> {
        tokio::spawn(async move { self.run(trigger).await })
            .await
            .map_err(|e| OrchestrationError::RunAborted(e.to_string()))?
    }

    /// Execute one retraining invocation.
    ///
    /// Errors are returned only when no `TrainingRun` was created (lock held
    /// elsewhere, no snapshot, store unavailable). Once a run exists every
    /// failure is recorded on it and reported through `RunResult`.
    pub async fn run(&self, trigger: TriggerContext) -> Result<RunResult> {
        let started = Instant::now();

        info!(
            requested_by = ?trigger.requested_by,
            snapshot_override = ?trigger.data_snapshot_ref,
            "Orchestrator: retraining triggered"
        );

        let Some(lease) = self.run_lock.try_acquire(&self.settings.lock_key).await? else {
            warn!(lock_key = %self.settings.lock_key, "Another run is active, rejecting trigger");
            return Err(OrchestrationError::ConcurrentRunRejected(
                self.settings.lock_key.clone(),
            ));
        };
        debug!(lock_key = %lease.key(), "Run lock acquired");

        let cancel = CancellationToken::new();
        *lock_slot(&self.active) = Some(ActiveRun {
            run_id: None,
            cancel: cancel.clone(),
        });
        let slot_guard = ActiveSlotGuard { slot: &self.active };

        let outcome = self.run_locked(trigger, &cancel, started).await;

        drop(slot_guard);
        drop(lease);

        match &outcome {
            Ok(result) => info!(
                run_id = ?result.run_id,
                status = ?result.status,
                verdict = ?result.verdict,
                metric_value = ?result.metric_value,
                active_model_ref = %result.active_model_ref,
                duration_ms = result.duration_ms,
                "Orchestrator: invocation finished"
            ),
            Err(e) => error!(error = %e, "Orchestrator: invocation aborted"),
        }

        outcome
    }

    async fn run_locked(
        &self,
        trigger: TriggerContext,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<RunResult> {
        self.reap_stale_runs().await?;

        let serving_state = self.store.read_serving_state().await?;
        let snapshot_ref = self.resolve_snapshot(&trigger).await?;

        if self.settings.skip_if_unchanged
            && trigger.data_snapshot_ref.is_none()
            && self.already_trained_on(&snapshot_ref).await?
        {
            info!(snapshot = %snapshot_ref, "No new data since last training, skipping");
            return Ok(RunResult {
                status: RunStatus::Skipped,
                run_id: None,
                verdict: None,
                metric_value: None,
                active_model_ref: serving_state.active_model_ref,
                failure: None,
                notified: false,
                duration_ms: elapsed_ms(started),
            });
        }

        if cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        let budget = chrono::Duration::from_std(self.settings.max_run_duration)
            .map_err(|e| OrchestrationError::ConfigError(format!("run budget out of range: {}", e)))?;

        let mut run = TrainingRun::pending(snapshot_ref, &serving_state, Utc::now() + budget);
        run.requested_by = trigger.requested_by.clone();

        // Persisted before launch so a crash leaves an auditable PENDING record
        self.store.append_run(&run).await?;
        {
            let mut slot = lock_slot(&self.active);
            if let Some(active) = slot.as_mut() {
                active.run_id = Some(run.run_id);
            }
        }

        info!(
            run_id = %run.run_id,
            snapshot = %run.data_snapshot_ref,
            baseline_model_ref = %run.baseline_model_ref,
            deadline = %run.deadline,
            "Run recorded as PENDING"
        );

        // === TRAIN ===
        let output = match self.train(&run, cancel).await {
            Ok(output) => output,
            Err(reason) => return self.finish_failed(run, &serving_state, reason, started).await,
        };

        run.record_candidate(&output)?;
        self.store.append_run(&run).await?;

        let (candidate_ref, metric_value) = match (&run.candidate_model_ref, run.metric_value) {
            (None, _) => {
                let reason = FailureReason::new(
                    FailureKind::TrainingFailure,
                    format!("job {} produced no model artifact", output.job_id),
                );
                return self.finish_failed(run, &serving_state, reason, started).await;
            }
            (Some(_), None) => {
                let reason = FailureReason::new(
                    FailureKind::InvalidMetric,
                    format!("job {} reported no MAPE", output.job_id),
                );
                return self.finish_failed(run, &serving_state, reason, started).await;
            }
            (Some(model_ref), Some(metric_value)) => (model_ref.clone(), metric_value),
        };

        if let Some(reason) = self.boundary_check(&run, cancel) {
            return self.finish_failed(run, &serving_state, reason, started).await;
        }

        // === EVALUATE ===
        let candidate = Candidate {
            model_ref: &candidate_ref,
            metric_value,
        };
        let assessment = match self.evaluator.assess(&candidate, self.settings.threshold) {
            Ok(assessment) => assessment,
            Err(e) => {
                let reason = FailureReason::from_error(&e);
                return self.finish_failed(run, &serving_state, reason, started).await;
            }
        };

        if let Some(reason) = self.boundary_check(&run, cancel) {
            return self.finish_failed(run, &serving_state, reason, started).await;
        }

        // === GATE === (not interruptible)
        let outcome = match self
            .gate
            .apply(&run, assessment.verdict, &serving_state, self.settings.threshold)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = FailureReason::from_error(&e);
                return self.finish_failed(run, &serving_state, reason, started).await;
            }
        };

        if let Err(e) = self.store.append_run(&outcome.run).await {
            error!(run_id = %run.run_id, error = %e, "Failed to record final run state");
            return Err(e);
        }

        let notified = match &outcome.notification {
            Some(notification) => self.deliver(notification).await,
            None => false,
        };

        Ok(build_result(
            &outcome.run,
            &outcome.serving_state.active_model_ref,
            notified,
            started,
        ))
    }

    async fn train(
        &self,
        run: &TrainingRun,
        cancel: &CancellationToken,
    ) -> std::result::Result<TrainingOutput, FailureReason> {
        if let Some(reason) = self.boundary_check(run, cancel) {
            return Err(reason);
        }

        let remaining = (run.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        debug!(run_id = %run.run_id, remaining_ms = remaining.as_millis() as u64, "Launching training job");

        let launch = self
            .runner
            .launch(&run.data_snapshot_ref, &self.settings.runtime_image_ref);

        tokio::select! {
            result = tokio::time::timeout(remaining, launch) => match result {
                Ok(Ok(output)) => {
                    info!(run_id = %run.run_id, job_id = %output.job_id, "Training job finished");
                    Ok(output)
                }
                Ok(Err(e)) => {
                    warn!(run_id = %run.run_id, error = %e, "Training job failed");
                    Err(FailureReason::from_error(&e))
                }
                Err(_) => {
                    warn!(run_id = %run.run_id, "Training job exceeded the run budget");
                    Err(FailureReason::new(
                        FailureKind::TrainingTimeout,
                        format!(
                            "training did not finish within the {}s run budget",
                            self.settings.max_run_duration.as_secs_f64()
                        ),
                    ))
                }
            },
            _ = cancel.cancelled() => {
                Err(FailureReason::new(FailureKind::Cancelled, "cancelled while training"))
            }
        }
    }

    fn boundary_check(
        &self,
        run: &TrainingRun,
        cancel: &CancellationToken,
    ) -> Option<FailureReason> {
        if cancel.is_cancelled() {
            return Some(FailureReason::new(FailureKind::Cancelled, "cancelled by operator"));
        }
        if Utc::now() > run.deadline {
            return Some(FailureReason::new(
                FailureKind::DeadlineExceeded,
                format!("run passed its deadline {}", run.deadline),
            ));
        }
        None
    }

    async fn finish_failed(
        &self,
        mut run: TrainingRun,
        serving_state: &ServingState,
        reason: FailureReason,
        started: Instant,
    ) -> Result<RunResult> {
        warn!(
            run_id = %run.run_id,
            kind = ?reason.kind,
            detail = %reason.detail,
            "Run failed"
        );

        let kind = reason.kind;
        run.mark_failed(reason)?;
        self.store.append_run(&run).await?;

        let notified = if self.settings.notify_on_training_failure && kind != FailureKind::Cancelled {
            let notification = build_notification(
                "Model retraining failed",
                Severity::Warning,
                &run,
                self.settings.threshold,
                &serving_state.active_model_ref,
                run.failure.as_ref().map(|f| f.detail.clone()),
            );
            self.deliver(&notification).await
        } else {
            false
        };

        Ok(build_result(&run, &serving_state.active_model_ref, notified, started))
    }

    async fn resolve_snapshot(&self, trigger: &TriggerContext) -> Result<String> {
        if let Some(snapshot_ref) = trigger
            .data_snapshot_ref
            .as_ref()
            .filter(|r| !r.trim().is_empty())
        {
            return Ok(snapshot_ref.clone());
        }

        match self.snapshots.latest().await {
            Ok(Some(snapshot)) => Ok(snapshot.snapshot_ref),
            Ok(None) => Err(OrchestrationError::SnapshotUnavailable(
                "no training data found".into(),
            )),
            Err(e) => Err(OrchestrationError::SnapshotUnavailable(e.to_string())),
        }
    }

    async fn already_trained_on(&self, snapshot_ref: &str) -> Result<bool> {
        let runs = self.store.list_runs().await?;
        Ok(runs
            .iter()
            .rev()
            .find(|r| matches!(r.verdict, RunVerdict::Promoted | RunVerdict::Rejected))
            .map(|r| r.data_snapshot_ref == snapshot_ref)
            .unwrap_or(false))
    }

    /// Fail PENDING runs that outlived their deadline.
    async fn reap_stale_runs(&self) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let mut reaped = Vec::new();

        for mut run in self.store.list_runs().await? {
            if !run.is_stale(now) {
                continue;
            }
            let detail = format!("found PENDING past its deadline {}", run.deadline);
            run.mark_failed(FailureReason::new(FailureKind::Abandoned, detail))?;
            self.store.append_run(&run).await?;

            warn!(run_id = %run.run_id, "Stale run marked FAILED");
            reaped.push(run.run_id);
        }

        Ok(reaped)
    }

    async fn deliver(&self, notification: &Notification) -> bool {
        match self.notifier.send(notification).await {
            Ok(()) => {
                info!(
                    run_id = %notification.body.run_id,
                    severity = %notification.severity,
                    sink = self.notifier.name(),
                    "Notification sent"
                );
                true
            }
            Err(e) => {
                warn!(
                    run_id = %notification.body.run_id,
                    error = %e,
                    "Notification delivery failed"
                );
                false
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn build_result(
    run: &TrainingRun,
    active_model_ref: &str,
    notified: bool,
    started: Instant,
) -> RunResult {
    let status = match run.verdict {
        RunVerdict::Promoted | RunVerdict::Rejected => RunStatus::Succeeded,
        RunVerdict::Failed | RunVerdict::Pending => RunStatus::Failed,
    };

    RunResult {
        status,
        run_id: Some(run.run_id),
        verdict: Some(run.verdict),
        metric_value: run.metric_value,
        active_model_ref: active_model_ref.to_string(),
        failure: run.failure.clone(),
        notified,
        duration_ms: elapsed_ms(started),
    }
}
