//! Drift evaluation
//!
//! Judges a freshly trained candidate against the configured threshold.
//! Pure and deterministic: no I/O, no history.

use crate::error::OrchestrationError;
use crate::models::Threshold;
use crate::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Accept,
    Reject,
}

/// The candidate under evaluation
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub model_ref: &'a str,
    pub metric_value: f64,
}

fn ensure_finite_non_negative(what: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(OrchestrationError::InvalidMetric(format!(
            "{} must be a finite non-negative number, got {}",
            what, value
        )));
    }
    Ok(())
}

/// Strict threshold check: `metric_value < threshold` accepts, ties reject.
pub fn evaluate(candidate_model_ref: &str, metric_value: f64, threshold: Threshold) -> Result<Verdict> {
    ensure_finite_non_negative("metric value", metric_value)?;
    ensure_finite_non_negative("threshold", threshold.value())?;

    if candidate_model_ref.trim().is_empty() {
        return Err(OrchestrationError::InvalidMetric(
            "metric reported for an empty model reference".into(),
        ));
    }

    if metric_value < threshold.value() {
        Ok(Verdict::Accept)
    } else {
        Ok(Verdict::Reject)
    }
}

/// Trait for a single verdict-producing check
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, candidate: &Candidate<'_>, threshold: Threshold) -> Result<EvaluationCheck>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationCheck {
    pub evaluator: String,
    pub verdict: Verdict,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftAssessment {
    pub verdict: Verdict,
    pub checks: Vec<EvaluationCheck>,
}

/// MAPE against a static threshold
pub struct MapeThresholdEvaluator;

impl Evaluator for MapeThresholdEvaluator {
    fn name(&self) -> &'static str {
        "mape_threshold"
    }

    fn evaluate(&self, candidate: &Candidate<'_>, threshold: Threshold) -> Result<EvaluationCheck> {
        let verdict = evaluate(candidate.model_ref, candidate.metric_value, threshold)?;

        Ok(EvaluationCheck {
            evaluator: self.name().to_string(),
            verdict,
            details: format!("MAPE {}% vs threshold {}%", candidate.metric_value, threshold),
        })
    }
}

/// Composes evaluators; the candidate is accepted only if every one accepts.
pub struct DriftEvaluator {
    evaluators: Vec<Box<dyn Evaluator>>,
}

impl DriftEvaluator {
    pub fn new() -> Self {
        Self {
            evaluators: Vec::new(),
        }
    }

    pub fn add_evaluator(&mut self, evaluator: Box<dyn Evaluator>) {
        self.evaluators.push(evaluator);
    }

    pub fn assess(&self, candidate: &Candidate<'_>, threshold: Threshold) -> Result<DriftAssessment> {
        if self.evaluators.is_empty() {
            return Err(OrchestrationError::InvalidMetric(
                "no evaluators configured".into(),
            ));
        }

        let mut checks = Vec::with_capacity(self.evaluators.len());
        for evaluator in &self.evaluators {
            checks.push(evaluator.evaluate(candidate, threshold)?);
        }

        let verdict = if checks.iter().all(|c| c.verdict == Verdict::Accept) {
            Verdict::Accept
        } else {
            Verdict::Reject
        };

        info!(
            model_ref = %candidate.model_ref,
            metric_value = candidate.metric_value,
            threshold = threshold.value(),
            verdict = ?verdict,
            "Drift evaluation completed"
        );

        Ok(DriftAssessment { verdict, checks })
    }
}

impl Default for DriftEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Drift evaluator with the MAPE threshold check only
pub fn create_default_drift_evaluator() -> DriftEvaluator {
    let mut evaluator = DriftEvaluator::new();
    evaluator.add_evaluator(Box::new(MapeThresholdEvaluator));
    evaluator
}
