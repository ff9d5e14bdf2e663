//! Sync endpoint routes.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    routing::{get, post},
    Json, Router,
};
use tally_engine::{ChangesResponse, SyncRequest, SyncResult};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::handlers::{handle_pull, handle_push, PullQuery};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(push_handler))
        .route("/sync/changes", get(pull_handler))
}

/// POST /sync - Reconcile a batch of operations.
async fn push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    payload: std::result::Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncResult>> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let result = handle_push(&state.reconciler, request).await?;
    Ok(Json(result))
}

/// GET /sync/changes - Records changed since a checkpoint.
async fn pull_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    query: std::result::Result<Query<PullQuery>, QueryRejection>,
) -> Result<Json<ChangesResponse>> {
    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let response = handle_pull(&state.reconciler, query).await?;
    Ok(Json(response))
}
