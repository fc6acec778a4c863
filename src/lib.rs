//! Forecast Retraining Orchestrator
//!
//! Periodically retrains a demand-forecasting model and decides whether the
//! new candidate replaces the one serving production:
//! - Launches the opaque training job on the latest data snapshot
//! - Judges the candidate's MAPE against a fixed threshold
//! - Promotes through a compare-and-swap on the single serving-state record
//! - Keeps an append-only, hash-chained log of every run
//! - Alerts operators when a candidate needs manual approval
//!
//! RUN:
//! LOCK → SNAPSHOT → PENDING → TRAIN → EVALUATE → GATE → RECORD → NOTIFY

pub mod api;
pub mod audit;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod gate;
pub mod lock;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod runner;
pub mod snapshot;
pub mod store;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::{Collaborators, RetrainingOrchestrator};
