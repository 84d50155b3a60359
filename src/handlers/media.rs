//! Media endpoint: manual WebSocket upgrade.
//!
//! The handshake is completed by hand so the relay controls the accept key
//! computation and the raw byte stream: the handler validates the token and
//! the `Sec-WebSocket-Key` header, answers `101 Switching Protocols`, and
//! hands the upgraded connection to a freshly spawned [`Session`] task.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::errors::ApiError;
use crate::middleware::auth::{self, RELAY_TOKEN_HEADER};
use crate::session::Session;
use crate::session::registry::SessionHandle;
use crate::state::AppState;
use crate::ws::handshake::accept_key;

/// Recognized upgrade query parameters. The call id may arrive under
/// several names depending on the fork configuration.
#[derive(Debug, Default, Deserialize)]
pub struct MediaQuery {
    token: Option<String>,
    #[serde(rename = "callId")]
    call_id: Option<String>,
    #[serde(rename = "call_id")]
    call_id_snake: Option<String>,
    stream_key: Option<String>,
}

impl MediaQuery {
    fn call_id(&self) -> Option<String> {
        self.call_id
            .clone()
            .or_else(|| self.call_id_snake.clone())
            .or_else(|| self.stream_key.clone())
    }
}

/// `GET /media`: upgrade to the inbound media stream.
pub async fn media_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MediaQuery>,
    mut request: Request,
) -> Result<Response, ApiError> {
    let presented = query.token.as_deref().or_else(|| {
        request
            .headers()
            .get(RELAY_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
    });
    auth::authorize(state.config.auth_token.as_deref(), presented)?;

    let key = request
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or(ApiError::MissingHandshakeKey)?;

    let on_upgrade = request
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(ApiError::UpgradeUnavailable)?;

    let handle = SessionHandle::new(query.call_id());
    state.registry.register(handle.clone());
    if let Some(call_id) = handle.call_id() {
        state.registry.attach(&handle, &call_id);
    }
    info!(
        session_id = %handle.id(),
        call_id = ?handle.call_id(),
        "media connection accepted"
    );

    let registry = state.registry.clone();
    let upstream_config = state.config.upstream.clone();
    let sink = state.sink.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let session = Session::new(
                    TokioIo::new(upgraded),
                    handle.clone(),
                    registry,
                    upstream_config,
                    sink,
                );
                session.run().await;
            }
            Err(e) => {
                warn!(session_id = %handle.id(), error = %e, "connection upgrade failed");
                registry.detach(&handle);
                handle.close("socket error");
            }
        }
    });

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(&key))
        .body(Body::empty());
    match response {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(error = %e, "failed to build upgrade response");
            Err(ApiError::UpgradeUnavailable)
        }
    }
}
