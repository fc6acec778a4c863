//! Promotion gate
//!
//! Applies the evaluator's verdict: swap the serving model on ACCEPT, keep the
//! old one on REJECT. `ServingState` only ever moves through a
//! compare-and-swap in this module.

use crate::error::OrchestrationError;
use crate::evaluator::Verdict;
use crate::models::{
    FailureKind, FailureReason, MetricDatum, Notification, NotificationBody, RunVerdict,
    ServingState, Severity, Threshold, TrainingRun, METRIC_DATA_DRIFT, METRIC_MODEL_DRIFT_DETECTED,
    METRIC_MODEL_MAPE,
};
use crate::store::MetricStore;
use crate::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod deployer;
pub use deployer::{HttpEndpointDeployer, ModelDeployer, ScriptedDeployer, StaticDeployer, SwapOutcome};

/// Result of applying a verdict
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub run: TrainingRun,
    pub serving_state: ServingState,
    pub notification: Option<Notification>,
    /// True when the run had already been decided and nothing was re-applied
    pub replayed: bool,
}

pub struct PromotionGate {
    store: Arc<dyn MetricStore>,
    deployer: Arc<dyn ModelDeployer>,
    notify_on_promotion: bool,
}

impl PromotionGate {
    pub fn new(
        store: Arc<dyn MetricStore>,
        deployer: Arc<dyn ModelDeployer>,
        notify_on_promotion: bool,
    ) -> Self {
        Self {
            store,
            deployer,
            notify_on_promotion,
        }
    }

    /// Apply `verdict` to `run` against the serving state read at trigger time.
    ///
    /// Safe to call again with the same run: a decided run, or one whose
    /// promotion already landed, is not applied twice.
    pub async fn apply(
        &self,
        run: &TrainingRun,
        verdict: Verdict,
        serving_state: &ServingState,
        threshold: Threshold,
    ) -> Result<GateOutcome> {
        if run.is_terminal() {
            info!(run_id = %run.run_id, verdict = %run.verdict, "Run already decided, gate replay ignored");
            return Ok(GateOutcome {
                run: run.clone(),
                serving_state: self.store.read_serving_state().await?,
                notification: None,
                replayed: true,
            });
        }

        let (Some(candidate_ref), Some(metric_value)) =
            (run.candidate_model_ref.clone(), run.metric_value)
        else {
            return Err(OrchestrationError::InvalidTransition(format!(
                "run {} reached the gate without an evaluated candidate",
                run.run_id
            )));
        };

        let mut run = run.clone();

        let current = self.store.read_serving_state().await?;
        if current.promoted_by_run == Some(run.run_id) {
            info!(run_id = %run.run_id, "Promotion already applied, marking run promoted");
            run.mark_promoted()?;
            return Ok(GateOutcome {
                run,
                serving_state: current,
                notification: None,
                replayed: true,
            });
        }

        match verdict {
            Verdict::Reject => {
                run.mark_rejected()?;
                self.publish_evaluation(&run, &candidate_ref, metric_value, Some(1.0))
                    .await;

                warn!(
                    run_id = %run.run_id,
                    metric_value = metric_value,
                    threshold = threshold.value(),
                    active_model_ref = %serving_state.active_model_ref,
                    "Candidate rejected, serving model unchanged"
                );

                let notification = build_notification(
                    "Model needs manual approval: MAPE threshold exceeded",
                    Severity::Warning,
                    &run,
                    threshold,
                    &serving_state.active_model_ref,
                    None,
                );

                Ok(GateOutcome {
                    run,
                    serving_state: serving_state.clone(),
                    notification: Some(notification),
                    replayed: false,
                })
            }
            Verdict::Accept => {
                let outcome = if current.version != serving_state.version {
                    let detail = format!(
                        "serving state moved from version {} to {} during the run",
                        serving_state.version, current.version
                    );
                    self.fail_promotion(run, current, threshold, detail)?
                } else {
                    self.promote(run, &candidate_ref, serving_state, threshold)
                        .await?
                };

                // Drift is only counted for a decided promotion
                let drift = (outcome.run.verdict == RunVerdict::Promoted).then_some(0.0);
                self.publish_evaluation(&outcome.run, &candidate_ref, metric_value, drift)
                    .await;

                Ok(outcome)
            }
        }
    }

    async fn promote(
        &self,
        mut run: TrainingRun,
        candidate_ref: &str,
        serving_state: &ServingState,
        threshold: Threshold,
    ) -> Result<GateOutcome> {
        let swap = match self.deployer.swap(candidate_ref).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return self.fail_promotion(run, serving_state.clone(), threshold, e.to_string());
            }
        };

        if let SwapOutcome::Indeterminate(detail) = swap {
            return self.ambiguous(run, serving_state, threshold, detail).await;
        }

        let next = serving_state.promote(&run)?;
        match self
            .store
            .compare_and_swap_serving_state(serving_state.version, &next)
            .await
        {
            Ok(true) => {
                run.mark_promoted()?;

                info!(
                    run_id = %run.run_id,
                    model_ref = %next.active_model_ref,
                    previous_model_ref = %serving_state.active_model_ref,
                    version = next.version,
                    "Candidate promoted"
                );

                let notification = self.notify_on_promotion.then(|| {
                    build_notification(
                        "Model promoted",
                        Severity::Info,
                        &run,
                        threshold,
                        &next.active_model_ref,
                        None,
                    )
                });

                Ok(GateOutcome {
                    run,
                    serving_state: next,
                    notification,
                    replayed: false,
                })
            }
            Ok(false) => {
                self.ambiguous(
                    run,
                    serving_state,
                    threshold,
                    "endpoint swapped but serving state was changed concurrently".into(),
                )
                .await
            }
            Err(e) => {
                self.ambiguous(
                    run,
                    serving_state,
                    threshold,
                    format!("endpoint swapped but serving state write failed: {}", e),
                )
                .await
            }
        }
    }

    /// The serving state is of unknown consistency. Never mark PROMOTED unless
    /// a fresh read proves the update landed.
    async fn ambiguous(
        &self,
        mut run: TrainingRun,
        before: &ServingState,
        threshold: Threshold,
        detail: String,
    ) -> Result<GateOutcome> {
        let after = match self.store.read_serving_state().await {
            Ok(state) => state,
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Serving state unreadable after ambiguous promotion");
                before.clone()
            }
        };

        if after.promoted_by_run == Some(run.run_id) {
            info!(run_id = %run.run_id, "Serving state update confirmed on re-read");
            run.mark_promoted()?;
            return Ok(GateOutcome {
                run,
                serving_state: after,
                notification: None,
                replayed: false,
            });
        }

        // Post-condition: the record still names a model that exists
        let known_models = [before.active_model_ref.as_str(), run.candidate_model_ref.as_deref().unwrap_or("")];
        let consistent = known_models.contains(&after.active_model_ref.as_str());
        let detail = if consistent {
            format!("{}; serving state still references {}", detail, after.active_model_ref)
        } else {
            format!(
                "{}; serving state references unknown model {}",
                detail, after.active_model_ref
            )
        };

        error!(
            run_id = %run.run_id,
            active_model_ref = %after.active_model_ref,
            consistent = consistent,
            detail = %detail,
            "Serving state update ambiguous"
        );

        run.mark_failed(FailureReason::new(
            FailureKind::ServingStateUpdateAmbiguous,
            detail.clone(),
        ))?;

        let notification = build_notification(
            "URGENT: serving state update ambiguous",
            Severity::Critical,
            &run,
            threshold,
            &after.active_model_ref,
            Some(detail),
        );

        Ok(GateOutcome {
            run,
            serving_state: after,
            notification: Some(notification),
            replayed: false,
        })
    }

    fn fail_promotion(
        &self,
        mut run: TrainingRun,
        serving_state: ServingState,
        threshold: Threshold,
        detail: String,
    ) -> Result<GateOutcome> {
        warn!(run_id = %run.run_id, detail = %detail, "Promotion refused, serving model unchanged");

        run.mark_failed(FailureReason::new(FailureKind::PromotionFailed, detail.clone()))?;

        let notification = build_notification(
            "Model promotion failed",
            Severity::Warning,
            &run,
            threshold,
            &serving_state.active_model_ref,
            Some(detail),
        );

        Ok(GateOutcome {
            run,
            serving_state,
            notification: Some(notification),
            replayed: false,
        })
    }

    async fn publish_evaluation(
        &self,
        run: &TrainingRun,
        candidate_ref: &str,
        metric_value: f64,
        drift_detected: Option<f64>,
    ) {
        let mut data = vec![MetricDatum::new(METRIC_MODEL_MAPE, metric_value)];
        if let Some(drift) = drift_detected {
            data.push(MetricDatum::new(METRIC_MODEL_DRIFT_DETECTED, drift));
            // Reserved for an input-distribution check
            data.push(MetricDatum::new(METRIC_DATA_DRIFT, 0.0));
        }

        for datum in data {
            let datum = datum
                .tag("model_ref", candidate_ref)
                .tag("run_id", run.run_id.to_string());
            let name = datum.name.clone();
            if let Err(e) = self.store.publish_metric(datum).await {
                warn!(metric = %name, error = %e, "Failed to publish metric");
            }
        }
    }
}

/// Build an operator notification for a decided run.
pub fn build_notification(
    subject: &str,
    severity: Severity,
    run: &TrainingRun,
    threshold: Threshold,
    active_model_ref: &str,
    detail: Option<String>,
) -> Notification {
    Notification {
        subject: subject.to_string(),
        severity,
        body: NotificationBody {
            run_id: run.run_id,
            metric_value: run.metric_value,
            threshold: threshold.value(),
            active_model_ref: active_model_ref.to_string(),
            candidate_model_ref: run.candidate_model_ref.clone(),
            detail,
        },
    }
}
