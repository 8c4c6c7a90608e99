//! HTTP handlers for the schedule write path and cache inspection.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use lib_signage::models::{Assignment, AssignmentId, AssignmentRequest};
use serde_json::json;

use crate::signage_logic::error::AppError;
use crate::signage_logic::state::AppState;

/// `POST /api/v1/schedules`
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<AssignmentRequest>,
) -> Result<(StatusCode, Json<Assignment>), AppError> {
    let created = state.engine.try_create(&request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `PUT /api/v1/schedules` with a JSON array; all or nothing.
pub async fn update_schedules(
    State(state): State<AppState>,
    Json(requests): Json<Vec<AssignmentRequest>>,
) -> Result<Json<Vec<Assignment>>, AppError> {
    let updated = state.engine.try_update_batch(&requests).await?;
    Ok(Json(updated))
}

/// `DELETE /api/v1/schedules/{id}`
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<AssignmentId>,
) -> Result<StatusCode, AppError> {
    state.engine.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/v1/cache/schedules`
pub async fn cache_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    let schedules = state.engine.cache_snapshot();
    Json(json!({
        "count": schedules.len(),
        "schedules": schedules,
    }))
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.uptime().as_secs(),
        "connectedMonitors": state.registry.len(),
        "cachedSchedules": state.engine.cache_snapshot().len(),
    }))
}
