//! Telephony audio relay.
//!
//! Accepts provider media WebSocket connections on `/media` using a manual
//! handshake and frame codec, forwards decoded audio to a streaming
//! transcription service, and POSTs finalized transcripts to a configured
//! webhook. A small control plane (`/healthz`, `DELETE /sessions/{call_id}`)
//! rides on the same listener.

pub mod config;
pub mod dispatch;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod session;
pub mod state;
pub mod upstream;
pub mod ws;

pub use config::RelayConfig;
pub use routes::create_router;
pub use state::AppState;
