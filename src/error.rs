//! Error types for the retraining orchestrator

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    // =============================
    // Run Outcome Errors
    // =============================

    #[error("Training failure: {0}")]
    TrainingFailure(String),

    #[error("Invalid metric: {0}")]
    InvalidMetric(String),

    #[error("Concurrent run rejected: lock '{0}' is held by another run")]
    ConcurrentRunRejected(String),

    #[error("Run cancelled by operator")]
    Cancelled,

    #[error("No data snapshot available: {0}")]
    SnapshotUnavailable(String),

    #[error("Run task aborted: {0}")]
    RunAborted(String),

    // =============================
    // Bookkeeping Errors
    // =============================

    #[error("Run {0} already has a terminal verdict")]
    RunFinalized(Uuid),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Metric store error: {0}")]
    StoreError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Deployment error: {0}")]
    DeployError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
