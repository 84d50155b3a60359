//! Route table for the relay.

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the relay router: the media upgrade endpoint plus the small
/// control plane. Unknown paths get the default 404.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::api::healthz))
        .route("/sessions/{call_id}", delete(handlers::api::delete_session))
        .route("/media", get(handlers::media::media_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
