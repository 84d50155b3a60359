//! Transcript dispatcher: delivers finalized utterances to the downstream
//! webhook.
//!
//! Delivery is fire-and-forget HTTP: a non-2xx response or transport failure
//! is logged and the transcript is discarded. There is no retry and no local
//! persistence; the callback target owns durability.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RelayConfig;

/// One finalized utterance bound for the callback target.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TranscriptEvent {
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(rename = "streamId")]
    pub stream_id: Option<String>,
    pub transcript: String,
    pub metadata: TranscriptMetadata,
}

/// Provider-supplied detail forwarded alongside the transcript text.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TranscriptMetadata {
    pub confidence: Option<f64>,
    pub words: Option<serde_json::Value>,
    #[serde(rename = "isFinal")]
    pub is_final: bool,
}

/// Delivery seam for finalized transcripts. The production implementation
/// POSTs to the configured webhook; tests substitute a recording sink.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn deliver(&self, event: TranscriptEvent);
}

/// HTTP webhook dispatcher.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    target: String,
    auth_token: Option<String>,
}

impl WebhookDispatcher {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            target: config.transcription_webhook_url.clone(),
            auth_token: config.auth_token.clone(),
        }
    }
}

#[async_trait]
impl TranscriptSink for WebhookDispatcher {
    async fn deliver(&self, event: TranscriptEvent) {
        let mut request = self.client.post(&self.target).json(&event);
        if let Some(token) = &self.auth_token {
            request = request.header("x-relay-token", token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(
                    call_id = %event.call_id,
                    chars = event.transcript.len(),
                    "delivered transcript"
                );
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_else(|_| "<no-body>".into());
                warn!(
                    call_id = %event.call_id,
                    %status,
                    body = %body,
                    "transcript callback rejected; dropping transcript"
                );
            }
            Err(e) => {
                warn!(
                    call_id = %event.call_id,
                    error = %e,
                    "failed to deliver transcript; dropping"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_event() -> TranscriptEvent {
        TranscriptEvent {
            call_id: "CALL1".to_string(),
            stream_id: Some("stream-7".to_string()),
            transcript: "hei maailma".to_string(),
            metadata: TranscriptMetadata {
                confidence: Some(0.92),
                words: None,
                is_final: true,
            },
        }
    }

    #[test]
    fn event_serializes_with_camel_case_keys() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["callId"], "CALL1");
        assert_eq!(json["streamId"], "stream-7");
        assert_eq!(json["transcript"], "hei maailma");
        assert_eq!(json["metadata"]["isFinal"], true);
        assert_eq!(json["metadata"]["confidence"], 0.92);
    }

    #[tokio::test]
    async fn posts_event_with_relay_token() {
        let server = MockServer::start().await;
        let expected = serde_json::to_string(&sample_event()).unwrap();
        Mock::given(method("POST"))
            .and(path("/transcription"))
            .and(header("x-relay-token", "secret"))
            .and(body_json_string(expected))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = RelayConfig {
            auth_token: Some("secret".to_string()),
            transcription_webhook_url: format!("{}/transcription", server.uri()),
            ..RelayConfig::default()
        };
        WebhookDispatcher::new(&config).deliver(sample_event()).await;
    }

    #[tokio::test]
    async fn rejection_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let config = RelayConfig {
            transcription_webhook_url: format!("{}/transcription", server.uri()),
            ..RelayConfig::default()
        };
        // Must not panic or error; the transcript is simply lost.
        WebhookDispatcher::new(&config).deliver(sample_event()).await;
    }

    #[tokio::test]
    async fn unreachable_target_is_swallowed() {
        let config = RelayConfig {
            transcription_webhook_url: "http://127.0.0.1:1/transcription".to_string(),
            ..RelayConfig::default()
        };
        WebhookDispatcher::new(&config).deliver(sample_event()).await;
    }
}
