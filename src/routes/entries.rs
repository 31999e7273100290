use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::db::models::{CreateManualTimeEntry, ManualTimeEntry};
use crate::db::ManualEntryRepository;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_entry).get(list_entries))
        .route("/import", post(import_entries))
}

async fn create_entry(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateManualTimeEntry>,
) -> AppResult<(StatusCode, Json<ManualTimeEntry>)> {
    let entry = ManualEntryRepository::create(&state.db, payload).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    work_item_id: Option<i64>,
    #[serde(default)]
    unsynced_only: bool,
}

async fn list_entries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<ManualTimeEntry>>> {
    let entries =
        ManualEntryRepository::list(&state.db, query.work_item_id, query.unsynced_only).await?;
    Ok(Json(entries))
}

/// Bulk import. Invalid entries are rejected individually; valid ones are
/// still stored, and the response says which rows were refused and why.
async fn import_entries(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Vec<CreateManualTimeEntry>>,
) -> AppResult<Json<serde_json::Value>> {
    if payload.is_empty() {
        return Err(AppError::BadRequest("No entries provided".to_string()));
    }

    let mut imported = 0usize;
    let mut rejected = Vec::new();

    for (index, entry) in payload.into_iter().enumerate() {
        match ManualEntryRepository::create(&state.db, entry).await {
            Ok(_) => imported += 1,
            Err(e) => rejected.push(json!({ "index": index, "error": e.to_string() })),
        }
    }

    tracing::info!(
        "Imported {} manual entries ({} rejected)",
        imported,
        rejected.len()
    );

    Ok(Json(json!({
        "imported": imported,
        "rejected": rejected
    })))
}
