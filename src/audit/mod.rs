//! Run log integrity and audit checks
//!
//! Every appended `TrainingRun` version is chained to its predecessor by a
//! SHA-256 digest, so the append-only history can be verified and replayed.

use crate::models::{RunVerdict, ServingState, TrainingRun};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use uuid::Uuid;

/// Digest used as `prev_digest` of the first entry
pub const GENESIS_DIGEST: &str = "";

/// One immutable entry in the run log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunLogEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub run: TrainingRun,
    pub prev_digest: String,
    pub digest: String,
}

impl RunLogEntry {
    pub fn new(seq: u64, run: TrainingRun, prev_digest: &str) -> Self {
        let digest = compute_entry_digest(prev_digest, &run);
        Self {
            seq,
            recorded_at: Utc::now(),
            run,
            prev_digest: prev_digest.to_string(),
            digest,
        }
    }
}

/// Compute SHA256 over the previous digest followed by the run's JSON form.
/// Streams serialization straight into the hasher.
pub fn compute_entry_digest(prev_digest: &str, run: &TrainingRun) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_digest.as_bytes());

    if serde_json::to_writer(&mut HashWriter(&mut hasher), run).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Recompute the whole chain. Entries must be in `seq` order.
pub fn verify_chain(entries: &[RunLogEntry]) -> bool {
    let mut prev = GENESIS_DIGEST.to_string();

    for entry in entries {
        if entry.prev_digest != prev {
            return false;
        }
        if compute_entry_digest(&prev, &entry.run) != entry.digest {
            return false;
        }
        prev = entry.digest.clone();
    }

    true
}

/// Latest version of every run, ordered by start time.
pub fn latest_runs(entries: &[RunLogEntry]) -> Vec<TrainingRun> {
    let mut latest: HashMap<Uuid, &TrainingRun> = HashMap::new();
    for entry in entries {
        latest.insert(entry.run.run_id, &entry.run);
    }

    let mut runs: Vec<TrainingRun> = latest.into_values().cloned().collect();
    runs.sort_by_key(|r| r.started_at);
    runs
}

/// The serving model must be the candidate of the most recent promoted run,
/// or the seed when nothing was ever promoted.
pub fn serving_state_consistent(
    entries: &[RunLogEntry],
    state: &ServingState,
    seed_model_ref: &str,
) -> bool {
    let last_promoted = entries
        .iter()
        .filter(|e| e.run.verdict == RunVerdict::Promoted)
        .max_by_key(|e| e.run.finished_at);

    match last_promoted {
        Some(entry) => {
            entry.run.candidate_model_ref.as_deref() == Some(state.active_model_ref.as_str())
                && state.promoted_by_run == Some(entry.run.run_id)
        }
        None => state.active_model_ref == seed_model_ref,
    }
}

/// PENDING runs whose deadline has passed
pub fn stale_runs(entries: &[RunLogEntry], now: DateTime<Utc>) -> Vec<TrainingRun> {
    latest_runs(entries)
        .into_iter()
        .filter(|run| run.is_stale(now))
        .collect()
}
