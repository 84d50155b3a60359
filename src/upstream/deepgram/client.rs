//! Outbound link to the streaming transcription provider.
//!
//! One [`UpstreamLink`] is spawned per relay session, lazily, on the first
//! start event. The connection task opens the provider WebSocket, sends the
//! one-time configuration message, and only then flips the shared readiness
//! watch to `true` — the session flushes its buffered audio at that point.
//! Finalized results are handed to the transcript sink through a forwarding
//! task so a slow callback never stalls audio forwarding.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::config::DeepgramConfig;
use super::messages::{StopRequest, UpstreamMessage};
use crate::dispatch::{TranscriptEvent, TranscriptMetadata, TranscriptSink};
use crate::errors::UpstreamError;
use crate::session::registry::SessionHandle;

/// Audio forwarding channel capacity. Large enough for bursts; a session
/// that outruns it backpressures at the send call.
const AUDIO_CHANNEL_CAPACITY: usize = 1024;

/// Transcript forwarding channel capacity.
const RESULT_CHANNEL_CAPACITY: usize = 256;

/// How long a closing session waits for the link task to finish.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the per-session upstream connection task.
pub struct UpstreamLink {
    audio_tx: mpsc::Sender<Bytes>,
    ready_rx: watch::Receiver<bool>,
    stop_tx: Option<oneshot::Sender<String>>,
    task: JoinHandle<()>,
}

impl UpstreamLink {
    /// Spawn the connection task. The link starts not-ready; readiness is
    /// observable through [`UpstreamLink::ready_watch`].
    pub fn spawn(
        config: DeepgramConfig,
        handle: Arc<SessionHandle>,
        sink: Arc<dyn TranscriptSink>,
    ) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(AUDIO_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = oneshot::channel::<String>();
        let (result_tx, mut result_rx) = mpsc::channel::<TranscriptEvent>(RESULT_CHANNEL_CAPACITY);

        // Transcript forwarding task: delivery awaits the callback HTTP
        // response, so it runs off the socket loop.
        tokio::spawn(async move {
            while let Some(event) = result_rx.recv().await {
                sink.deliver(event).await;
            }
        });

        let task = tokio::spawn(run_link(config, handle, ready_tx, audio_rx, stop_rx, result_tx));

        Self {
            audio_tx,
            ready_rx,
            stop_tx: Some(stop_tx),
            task,
        }
    }

    /// Whether the configuration message has been sent successfully.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Readiness watch for the owning session to select on.
    pub fn ready_watch(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Whether the connection task has exited (connect failure or
    /// unexpected upstream closure).
    pub fn is_terminated(&self) -> bool {
        self.task.is_finished()
    }

    /// Queue one audio chunk for forwarding. Chunks are delivered to the
    /// provider in the order they are sent here.
    pub async fn send_audio(&self, chunk: Bytes) -> Result<(), UpstreamError> {
        self.audio_tx
            .send(chunk)
            .await
            .map_err(|_| UpstreamError::LinkClosed)
    }

    /// Notify the provider the stream is over and close the link. Failures
    /// are logged, never propagated.
    pub async fn stop(mut self, reason: &str) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(reason.to_string());
        }
        if timeout(STOP_JOIN_TIMEOUT, &mut self.task).await.is_err() {
            warn!("upstream link did not close in time; aborting task");
            self.task.abort();
        }
    }
}

impl Drop for UpstreamLink {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send("session dropped".to_string());
        }
    }
}

fn build_request(
    ws_url: &str,
    api_key: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, UpstreamError> {
    let url = Url::parse(ws_url).map_err(|e| UpstreamError::Request(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| UpstreamError::Request(format!("no host in '{ws_url}'")))?;
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    tokio_tungstenite::tungstenite::http::Request::builder()
        .method("GET")
        .uri(ws_url)
        .header("Host", host_header)
        .header("Upgrade", "websocket")
        .header("Connection", "upgrade")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Version", "13")
        .header("Authorization", format!("Token {api_key}"))
        .body(())
        .map_err(|e| UpstreamError::Request(e.to_string()))
}

async fn run_link(
    config: DeepgramConfig,
    handle: Arc<SessionHandle>,
    ready_tx: watch::Sender<bool>,
    mut audio_rx: mpsc::Receiver<Bytes>,
    mut stop_rx: oneshot::Receiver<String>,
    result_tx: mpsc::Sender<TranscriptEvent>,
) {
    let session_id = handle.id();

    let Some(api_key) = config.api_key.clone() else {
        // Guarded by the caller; a link is never spawned without a key.
        error!(%session_id, "upstream link spawned without an API key");
        return;
    };

    let request = match build_request(&config.ws_url, &api_key) {
        Ok(request) => request,
        Err(e) => {
            error!(%session_id, error = %e, "failed to build upstream request");
            return;
        }
    };

    let (ws_stream, _response) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            error!(%session_id, error = %e, "failed to connect to transcription upstream");
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    // One-time stream configuration; readiness is signalled only after
    // this send succeeds.
    let start_request = match serde_json::to_string(&config.start_request()) {
        Ok(json) => json,
        Err(e) => {
            error!(%session_id, error = %e, "failed to serialize start request");
            return;
        }
    };
    if let Err(e) = ws_sink.send(Message::Text(start_request.into())).await {
        error!(%session_id, error = %e, "failed to send upstream configuration");
        return;
    }
    let _ = ready_tx.send(true);
    info!(
        %session_id,
        call_id = ?handle.call_id(),
        "transcription upstream ready"
    );

    let mut stopping = false;
    loop {
        tokio::select! {
            chunk = audio_rx.recv() => match chunk {
                Some(chunk) => {
                    let len = chunk.len();
                    if let Err(e) = ws_sink.send(Message::Binary(chunk)).await {
                        warn!(%session_id, error = %e, "failed to forward audio upstream");
                        break;
                    }
                    debug!(%session_id, bytes = len, "forwarded audio chunk upstream");
                }
                // The owning session went away without a stop; just close.
                None => break,
            },

            message = ws_stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_provider_message(&text, &handle, &result_tx);
                }
                Some(Ok(Message::Close(frame))) => {
                    if !stopping {
                        warn!(%session_id, ?frame, "upstream connection closed unexpectedly");
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%session_id, error = %e, "upstream socket error");
                    break;
                }
                None => {
                    if !stopping {
                        warn!(%session_id, "upstream stream ended unexpectedly");
                    }
                    break;
                }
            },

            reason = &mut stop_rx => {
                stopping = true;
                let reason = reason.unwrap_or_else(|_| "closed".to_string());
                match serde_json::to_string(&StopRequest::new(reason)) {
                    Ok(json) => {
                        let _ = ws_sink.send(Message::Text(json.into())).await;
                    }
                    Err(e) => warn!(%session_id, error = %e, "failed to serialize stop request"),
                }
                let _ = ws_sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    let _ = ready_tx.send(false);
    debug!(%session_id, "upstream link closed");
}

/// Interpret one provider text message; finalized non-empty transcripts for
/// a known call are queued for delivery, everything else is logged.
fn handle_provider_message(
    text: &str,
    handle: &Arc<SessionHandle>,
    result_tx: &mpsc::Sender<TranscriptEvent>,
) {
    match UpstreamMessage::parse(text) {
        Ok(UpstreamMessage::Results(results)) => {
            let Some(alternative) = results.first_alternative() else {
                return;
            };
            let transcript = alternative.transcript.trim();
            if !results.is_finalized() || transcript.is_empty() {
                return;
            }
            let Some(call_id) = handle.call_id() else {
                debug!(
                    session_id = %handle.id(),
                    "finalized transcript for session without call id; dropping"
                );
                return;
            };

            let event = TranscriptEvent {
                call_id,
                stream_id: handle.stream_id(),
                transcript: transcript.to_string(),
                metadata: TranscriptMetadata {
                    confidence: alternative.confidence,
                    words: alternative.words.clone(),
                    is_final: true,
                },
            };
            if result_tx.try_send(event).is_err() {
                warn!(
                    session_id = %handle.id(),
                    "transcript channel full or closed; dropping transcript"
                );
            }
        }
        Ok(UpstreamMessage::Error(raw)) => {
            error!(session_id = %handle.id(), message = %raw, "transcription upstream reported an error");
        }
        Ok(UpstreamMessage::Unknown) => {
            debug!(session_id = %handle.id(), "ignoring unrecognized upstream message");
        }
        Err(e) => {
            warn!(session_id = %handle.id(), error = %e, "failed to parse upstream message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<TranscriptEvent>>,
    }

    #[async_trait]
    impl TranscriptSink for RecordingSink {
        async fn deliver(&self, event: TranscriptEvent) {
            self.events.lock().push(event);
        }
    }

    /// What the mock provider observed, in order.
    #[derive(Debug, PartialEq)]
    enum Observed {
        Text(String),
        Binary(Vec<u8>),
    }

    /// Minimal mock provider: records inbound messages and plays back a
    /// scripted list of result payloads once the configuration arrives.
    async fn spawn_mock_provider(
        results_after_config: Vec<String>,
    ) -> (String, mpsc::UnboundedReceiver<Observed>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (observed_tx, observed_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let (mut sink, mut stream) = ws.split();

            while let Some(Ok(message)) = stream.next().await {
                match message {
                    Message::Text(text) => {
                        let is_config = text.contains("start_request");
                        let is_stop = text.contains("stop_request");
                        let _ = observed_tx.send(Observed::Text(text.to_string()));
                        if is_config {
                            for payload in &results_after_config {
                                sink.send(Message::Text(payload.clone().into()))
                                    .await
                                    .unwrap();
                            }
                        }
                        if is_stop {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        let _ = observed_tx.send(Observed::Binary(data.to_vec()));
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        (format!("ws://{addr}"), observed_rx)
    }

    async fn wait_ready(link: &UpstreamLink) {
        let mut ready = link.ready_watch();
        timeout(Duration::from_secs(5), async {
            while !*ready.borrow() {
                ready.changed().await.unwrap();
            }
        })
        .await
        .expect("link never became ready");
    }

    fn test_config(ws_url: String) -> DeepgramConfig {
        DeepgramConfig {
            api_key: Some("test-key".to_string()),
            ws_url,
            ..DeepgramConfig::default()
        }
    }

    #[tokio::test]
    async fn config_is_sent_before_audio_and_order_is_preserved() {
        let (url, mut observed) = spawn_mock_provider(vec![]).await;
        let handle = SessionHandle::new(Some("CALL1".to_string()));
        let sink = Arc::new(RecordingSink::default());
        let link = UpstreamLink::spawn(test_config(url), handle, sink);

        wait_ready(&link).await;
        link.send_audio(Bytes::from_static(b"\x00\x00")).await.unwrap();
        link.send_audio(Bytes::from_static(b"\x04\x10")).await.unwrap();

        let first = observed.recv().await.unwrap();
        match first {
            Observed::Text(text) => {
                let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(json["type"], "start_request");
            }
            other => panic!("expected configuration first, got {other:?}"),
        }
        assert_eq!(
            observed.recv().await.unwrap(),
            Observed::Binary(b"\x00\x00".to_vec())
        );
        assert_eq!(
            observed.recv().await.unwrap(),
            Observed::Binary(b"\x04\x10".to_vec())
        );

        link.stop("received close").await;
        match observed.recv().await.unwrap() {
            Observed::Text(text) => {
                let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(json["type"], "stop_request");
                assert_eq!(json["reason"], "received close");
            }
            other => panic!("expected stop request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn only_finalized_transcripts_reach_the_sink() {
        let interim = r#"{"type":"Results","is_final":false,
            "channel":{"alternatives":[{"transcript":"hei","confidence":0.5}]}}"#;
        let empty_final = r#"{"type":"Results","is_final":true,
            "channel":{"alternatives":[{"transcript":"  "}]}}"#;
        let final_result = r#"{"type":"Results","is_final":true,
            "channel":{"alternatives":[{"transcript":"hei maailma","confidence":0.97}]}}"#;
        let provider_error = r#"{"type":"Error","description":"boom"}"#;

        let (url, _observed) = spawn_mock_provider(vec![
            interim.to_string(),
            empty_final.to_string(),
            provider_error.to_string(),
            final_result.to_string(),
        ])
        .await;
        let handle = SessionHandle::new(Some("CALL1".to_string()));
        handle.set_stream_id("stream-9".to_string());
        let sink = Arc::new(RecordingSink::default());
        let link = UpstreamLink::spawn(test_config(url), handle, sink.clone());

        wait_ready(&link).await;
        timeout(Duration::from_secs(5), async {
            while sink.events.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no transcript delivered");

        // Give stray deliveries a moment to show up, then assert exactly one.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = sink.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].call_id, "CALL1");
        assert_eq!(events[0].stream_id.as_deref(), Some("stream-9"));
        assert_eq!(events[0].transcript, "hei maailma");
        assert!(events[0].metadata.is_final);
        assert_eq!(events[0].metadata.confidence, Some(0.97));

        link.stop("shutdown").await;
    }

    #[tokio::test]
    async fn connect_failure_terminates_link_without_readiness() {
        // Nothing listens on this port.
        let link = UpstreamLink::spawn(
            test_config("ws://127.0.0.1:9".to_string()),
            SessionHandle::new(None),
            Arc::new(RecordingSink::default()),
        );
        timeout(Duration::from_secs(5), async {
            while !link.is_terminated() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("link task did not terminate");
        assert!(!link.is_ready());
    }
}
