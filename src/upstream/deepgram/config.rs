//! Configuration for the Deepgram streaming connection.

use super::messages::{StartRequest, StreamConfig};

/// Silence-based endpointing threshold sent in the start request (ms).
pub const ENDPOINTING_MS: u32 = 300;

/// Connection settings for the streaming transcription provider.
#[derive(Debug, Clone)]
pub struct DeepgramConfig {
    /// API key; when unset, transcription is disabled and inbound audio
    /// is accepted but dropped.
    pub api_key: Option<String>,
    /// WebSocket endpoint, without trailing slash.
    pub ws_url: String,
    /// BCP-47-ish language tag (e.g. "fi", "en-US").
    pub language: String,
    /// Audio encoding of the forwarded media ("mulaw", "linear16", ...).
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DeepgramConfig {
    /// Whether an upstream link can be established at all.
    pub fn enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Build the one-time configuration message sent when the link opens.
    pub fn start_request(&self) -> StartRequest {
        StartRequest::new(StreamConfig {
            language: self.language.clone(),
            encoding: self.encoding.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            interim_results: false,
            smart_format: true,
            punctuate: true,
            endpointing: ENDPOINTING_MS,
        })
    }
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            ws_url: "wss://api.deepgram.com/v1/listen".to_string(),
            language: "fi".to_string(),
            encoding: "mulaw".to_string(),
            sample_rate: 8000,
            channels: 1,
        }
    }
}
