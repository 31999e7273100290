use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::core::report::TriggerKind;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/trigger", post(trigger_run))
        .route("/history", get(get_history))
        .route("/report", get(latest_report))
        .route("/cancel", post(cancel_run))
}

pub fn schedule_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/pause", post(pause_schedule))
        .route("/resume", post(resume_schedule))
}

/// Trigger a reconciliation run on demand. The run executes in the
/// background; the response only reports whether it started, was queued
/// behind the active run, or was dropped.
async fn trigger_run(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    let decision = state.scheduler.trigger(TriggerKind::OnDemand).await;
    Ok(Json(json!({ "decision": decision })))
}

async fn get_history(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    let history = state.scheduler.history().await;
    Ok(Json(json!({ "executions": history })))
}

/// Full report of the most recently finished run.
async fn latest_report(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    match state.run_handles.latest_report().await {
        Some(report) => Ok(Json(serde_json::to_value(report).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("serializing report: {}", e))
        })?)),
        None => Err(AppError::NotFound("No completed run yet".to_string())),
    }
}

/// Request cooperative cancellation of the active run. Cancellation takes
/// effect between work-item apply steps; the checkpoint stays in place so
/// the run can be resumed later.
async fn cancel_run(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    if !state.scheduler.is_run_active() {
        return Ok(Json(json!({
            "cancelled": false,
            "message": "No active run"
        })));
    }
    state.run_handles.request_cancel();
    Ok(Json(json!({ "cancelled": true })))
}

async fn pause_schedule(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    state.scheduler.pause();
    Ok(Json(json!({ "paused": true })))
}

async fn resume_schedule(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<serde_json::Value>> {
    state.scheduler.resume();
    Ok(Json(json!({ "paused": false })))
}
