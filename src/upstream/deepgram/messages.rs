//! Wire messages exchanged with the streaming transcription provider.
//!
//! Outbound: the one-time `start_request` configuration and the
//! `stop_request` sent when a session closes. Audio itself travels as raw
//! binary frames, not JSON.
//!
//! Inbound: `results` messages carrying transcript alternatives and a
//! finality flag, plus provider-reported `error` messages.

use serde::{Deserialize, Serialize};

// =============================================================================
// Outgoing messages (relay to provider)
// =============================================================================

/// Stream configuration nested inside the start request.
#[derive(Debug, Clone, Serialize)]
pub struct StreamConfig {
    pub language: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub interim_results: bool,
    pub smart_format: bool,
    pub punctuate: bool,
    /// Silence-based endpointing threshold in milliseconds.
    pub endpointing: u32,
}

/// Sent once, immediately after the upstream connection opens.
#[derive(Debug, Clone, Serialize)]
pub struct StartRequest {
    #[serde(rename = "type")]
    message_type: &'static str,
    config: StreamConfig,
}

impl StartRequest {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            message_type: "start_request",
            config,
        }
    }
}

/// Sent when the session closes while the link is still open.
#[derive(Debug, Clone, Serialize)]
pub struct StopRequest {
    #[serde(rename = "type")]
    message_type: &'static str,
    reason: String,
}

impl StopRequest {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            message_type: "stop_request",
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Incoming messages (provider to relay)
// =============================================================================

/// One transcription hypothesis.
#[derive(Debug, Clone, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Word-level detail, forwarded opaquely to the callback.
    #[serde(default)]
    pub words: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

/// A `results` announcement. Finality may arrive under several names
/// depending on provider mode; the first flag present wins.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsMessage {
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub is_final: Option<bool>,
    #[serde(default)]
    pub speech_final: Option<bool>,
    #[serde(default, rename = "final")]
    pub final_flag: Option<bool>,
}

impl ResultsMessage {
    /// Whether the provider marks this result as no longer subject to
    /// revision: explicit final flag, then speech-final, then the generic
    /// flag; first present wins.
    pub fn is_finalized(&self) -> bool {
        self.is_final
            .or(self.speech_final)
            .or(self.final_flag)
            .unwrap_or(false)
    }

    pub fn first_alternative(&self) -> Option<&Alternative> {
        self.channel.as_ref()?.alternatives.first()
    }
}

/// Parsed provider message.
#[derive(Debug)]
pub enum UpstreamMessage {
    Results(ResultsMessage),
    /// Provider-reported error; logged, non-fatal.
    Error(String),
    /// Anything without a recognizable announcement type.
    Unknown,
}

impl UpstreamMessage {
    /// Parse a provider text message. The announcement type lives under
    /// `type` or `message_type`; results are only meaningful when channel
    /// data is attached.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct TypePeek {
            #[serde(default, rename = "type")]
            kind: Option<String>,
            #[serde(default)]
            message_type: Option<String>,
        }

        let peek: TypePeek = serde_json::from_str(text)?;
        let kind = match peek.kind.or(peek.message_type) {
            Some(kind) => kind.to_lowercase(),
            None => return Ok(UpstreamMessage::Unknown),
        };

        match kind.as_str() {
            "results" => {
                let msg: ResultsMessage = serde_json::from_str(text)?;
                if msg.channel.is_some() {
                    Ok(UpstreamMessage::Results(msg))
                } else {
                    Ok(UpstreamMessage::Unknown)
                }
            }
            "error" => Ok(UpstreamMessage::Error(text.to_string())),
            _ => Ok(UpstreamMessage::Unknown),
        }
    }
}
