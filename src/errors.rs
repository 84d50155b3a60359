//! Error types for the relay, grouped per concern.
//!
//! Control-plane failures become JSON HTTP responses via [`ApiError`];
//! everything on the streaming path is fatal to at most one session and is
//! reported through [`ProtocolError`] / [`UpstreamError`] to a logging
//! boundary, never across sessions.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced on the control-plane HTTP endpoints and during the
/// upgrade handshake.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("session not found")]
    SessionNotFound,

    /// The upgrade request is missing the `Sec-WebSocket-Key` header.
    #[error("missing websocket handshake key")]
    MissingHandshakeKey,

    /// The underlying connection does not support protocol upgrades
    /// (e.g. HTTP/2 request on the media endpoint).
    #[error("connection cannot be upgraded")]
    UpgradeUnavailable,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::SessionNotFound => StatusCode::NOT_FOUND,
            ApiError::MissingHandshakeKey => StatusCode::BAD_REQUEST,
            ApiError::UpgradeUnavailable => StatusCode::UPGRADE_REQUIRED,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "ok": false, "message": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// Violations of the inbound framing protocol. All of these are fatal to
/// the single session; the connection is closed with reason "protocol error".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Clients must mask every frame they send.
    #[error("received unmasked frame from client")]
    UnmaskedFrame,

    #[error("frame payload of {0} bytes exceeds the maximum allowed size")]
    FrameTooLarge(u64),
}

/// Failures on the outbound transcription link. Logged per session,
/// never propagated to other sessions.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to build upstream request: {0}")]
    Request(String),

    /// The link task has terminated and no longer accepts audio.
    #[error("upstream link is closed")]
    LinkClosed,
}

/// Malformed inbound control/audio messages. Non-fatal: the frame is
/// logged and dropped, the session continues.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Configuration loading/validation failures. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
