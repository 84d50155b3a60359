//! Control-plane endpoints: health and session cleanup.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::{Value, json};
use tracing::info;

use crate::errors::ApiError;
use crate::middleware::auth::{self, RELAY_TOKEN_HEADER};
use crate::state::AppState;

pub async fn healthz() -> &'static str {
    "ok"
}

/// `DELETE /sessions/{call_id}`: tear down the live session for a call.
/// Used by the call orchestrator when a call ends through a path the media
/// stream does not observe.
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let presented = headers
        .get(RELAY_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    auth::authorize(state.config.auth_token.as_deref(), presented)?;

    let session = state
        .registry
        .remove_by_call(&call_id)
        .ok_or(ApiError::SessionNotFound)?;
    session.close("cleanup requested");
    info!(call_id = %call_id, session_id = %session.id(), "session cleanup requested");

    Ok(Json(json!({ "ok": true })))
}
