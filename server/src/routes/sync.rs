//! Sync endpoint routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use uuid::Uuid;
use ward_engine::{ExportPage, ImportReport};

use crate::error::Result;
use crate::handlers::{
    end_session, handle_export, handle_pull, handle_push, handle_snapshot, now_millis,
    start_session, ExportParams, PullQuery, PullResponse, PushRequest, SnapshotParams,
    SnapshotResponse, StartSessionResponse,
};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(start_handler))
        .route("/sync/{id}", delete(end_handler))
        .route("/sync/{id}/pull", post(snapshot_handler).get(pull_handler))
        .route("/sync/{id}/push", post(push_handler))
        .route("/export", get(export_handler))
}

/// POST /sync - Open a session.
async fn start_handler(State(state): State<AppState>) -> Result<Json<StartSessionResponse>> {
    let response = start_session(&state.pool, now_millis()).await?;
    Ok(Json(response))
}

/// DELETE /sync/{id} - Finish a session.
async fn end_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    end_session(&state.pool, id, now_millis()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /sync/{id}/pull - Build the session's snapshot.
async fn snapshot_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(params): Json<SnapshotParams>,
) -> Result<Json<SnapshotResponse>> {
    let response = handle_snapshot(
        &state.pool,
        &state.schema,
        &state.config.sync,
        id,
        params,
        now_millis(),
    )
    .await?;
    Ok(Json(response))
}

/// GET /sync/{id}/pull - Page through the session's snapshot.
async fn pull_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>> {
    let response = handle_pull(&state.pool, &state.config.sync, id, query, now_millis()).await?;
    Ok(Json(response))
}

/// POST /sync/{id}/push - Apply a batch of records.
async fn push_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PushRequest>,
) -> Result<Json<ImportReport>> {
    let report = handle_push(
        &state.pool,
        &state.schema,
        &state.router,
        &state.config.sync,
        id,
        request,
        now_millis(),
    )
    .await?;
    Ok(Json(report))
}

/// GET /export - Page a channel out without a session.
async fn export_handler(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Json<ExportPage>> {
    let page = handle_export(&state.pool, &state.schema, &state.router, params).await?;
    Ok(Json(page))
}
