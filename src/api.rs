//! REST API server for the retraining orchestrator
//!
//! Lets the scheduler trigger runs over HTTP and exposes the run log and the
//! serving state to operators.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{serving_state_consistent, stale_runs, verify_chain};
use crate::error::OrchestrationError;
use crate::models::{RunStatus, TriggerContext};
use crate::orchestrator::RetrainingOrchestrator;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn error_response(err: OrchestrationError) -> ApiResult {
    let status = match &err {
        OrchestrationError::ConcurrentRunRejected(_) => StatusCode::CONFLICT,
        OrchestrationError::SnapshotUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(err.to_string())))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<RetrainingOrchestrator>,
    /// Model served before any promotion, used by the audit check
    pub seed_model_ref: String,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Retraining Endpoints
/// =============================

async fn trigger_retrain(
    State(state): State<ApiState>,
    body: Option<Json<TriggerContext>>,
) -> ApiResult {
    let trigger = body.map(|Json(t)| t).unwrap_or_default();
    info!(requested_by = ?trigger.requested_by, "Received retrain trigger");

    // Detached so a client disconnect cannot abort the run mid-promotion
    match state.orchestrator.clone().run_detached(trigger).await {
        Ok(result) => {
            let status = match result.status {
                RunStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
                RunStatus::Succeeded | RunStatus::Skipped => StatusCode::OK,
            };
            let mut response = ApiResponse::success(&result);
            if let Some(failure) = &result.failure {
                response.error = Some(failure.detail.clone());
            }
            (status, Json(response))
        }
        Err(e) => {
            warn!(error = %e, "Retrain trigger not run");
            error_response(e)
        }
    }
}

async fn cancel_retrain(State(state): State<ApiState>) -> ApiResult {
    let run_id = state.orchestrator.active_run_id();
    let cancelled = state.orchestrator.cancel_active_run();

    (
        StatusCode::OK,
        Json(ApiResponse::success(json!({
            "cancelled": cancelled,
            "run_id": run_id,
        }))),
    )
}

async fn serving_state(State(state): State<ApiState>) -> ApiResult {
    match state.orchestrator.store().read_serving_state().await {
        Ok(serving) => (StatusCode::OK, Json(ApiResponse::success(serving))),
        Err(e) => error_response(e),
    }
}

async fn list_runs(State(state): State<ApiState>) -> ApiResult {
    match state.orchestrator.store().list_runs().await {
        Ok(runs) => (StatusCode::OK, Json(ApiResponse::success(runs))),
        Err(e) => error_response(e),
    }
}

async fn get_run(State(state): State<ApiState>, Path(run_id): Path<Uuid>) -> ApiResult {
    match state.orchestrator.store().load_run(run_id).await {
        Ok(Some(run)) => (StatusCode::OK, Json(ApiResponse::success(run))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("run {} not found", run_id))),
        ),
        Err(e) => error_response(e),
    }
}

async fn audit(State(state): State<ApiState>) -> ApiResult {
    let store = state.orchestrator.store();

    let entries = match store.run_log().await {
        Ok(entries) => entries,
        Err(e) => return error_response(e),
    };
    let serving = match store.read_serving_state().await {
        Ok(serving) => serving,
        Err(e) => return error_response(e),
    };

    let stale: Vec<Uuid> = stale_runs(&entries, Utc::now())
        .into_iter()
        .map(|r| r.run_id)
        .collect();

    (
        StatusCode::OK,
        Json(ApiResponse::success(json!({
            "entries": entries.len(),
            "chain_valid": verify_chain(&entries),
            "serving_state_consistent": serving_state_consistent(&entries, &serving, &state.seed_model_ref),
            "stale_runs": stale,
        }))),
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<RetrainingOrchestrator>, seed_model_ref: String) -> Router {
    let state = ApiState {
        orchestrator,
        seed_model_ref,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/retrain", post(trigger_retrain))
        .route("/api/retrain/cancel", post(cancel_retrain))
        .route("/api/serving-state", get(serving_state))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/:run_id", get(get_run))
        .route("/api/audit", get(audit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<RetrainingOrchestrator>,
    seed_model_ref: String,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator, seed_model_ref);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
