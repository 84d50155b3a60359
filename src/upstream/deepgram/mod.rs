//! Deepgram streaming transcription integration.

pub mod client;
pub mod config;
pub mod messages;

pub use client::UpstreamLink;
pub use config::DeepgramConfig;
