//! Per-connection relay session.
//!
//! Each accepted media connection runs one [`Session`] on its own task. The
//! session owns the upgraded socket, the frame accumulation buffer, the
//! audio backlog and the upstream link; nothing else touches them. External
//! actors (the control plane, supersession, shutdown) reach the session only
//! through its [`SessionHandle`] cancellation token.
//!
//! The session is an explicit state machine. Audio arriving while the
//! upstream link is still connecting is buffered and flushed in arrival
//! order the moment the link reports ready, so the upstream always sees its
//! configuration message first and audio in the order the client sent it.

pub mod events;
pub mod registry;

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatch::TranscriptSink;
use crate::session::events::InboundEvent;
use crate::session::registry::{SessionHandle, SessionRegistry};
use crate::upstream::deepgram::{DeepgramConfig, UpstreamLink};
use crate::ws::frame::{self, Frame, Opcode};

/// Maximum audio chunks held while the upstream link is connecting. At
/// telephony rates this is several minutes of audio; a connect that slow is
/// already dead, so further chunks are dropped with a warning.
const MAX_PENDING_AUDIO_CHUNKS: usize = 512;

/// Initial capacity of the inbound frame accumulation buffer.
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Handshaking,
    AwaitingStart,
    Streaming,
    UpstreamConnecting,
    UpstreamReady,
    Closing,
    Closed,
}

/// What the event loop decided to do next. Computed inside the select so
/// the arms only touch the fields they poll.
enum Step {
    Cancelled,
    ReadyChanged,
    ReadyClosed,
    Read,
    Eof,
    SocketError(std::io::Error),
}

/// One relay session over an upgraded connection.
pub struct Session<S> {
    io: S,
    raw_buffer: BytesMut,
    pending_audio: VecDeque<Bytes>,
    upstream: Option<UpstreamLink>,
    handle: Arc<SessionHandle>,
    registry: Arc<SessionRegistry>,
    upstream_config: DeepgramConfig,
    sink: Arc<dyn TranscriptSink>,
    state: SessionState,
    // Keeps `ready_rx` valid while no upstream link exists; never signals.
    idle_ready: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// The handshake has already been completed by the upgrade handler;
    /// `io` is the raw upgraded stream.
    pub fn new(
        io: S,
        handle: Arc<SessionHandle>,
        registry: Arc<SessionRegistry>,
        upstream_config: DeepgramConfig,
        sink: Arc<dyn TranscriptSink>,
    ) -> Self {
        let (idle_ready, ready_rx) = watch::channel(false);
        Self {
            io,
            raw_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            pending_audio: VecDeque::new(),
            upstream: None,
            handle,
            registry,
            upstream_config,
            sink,
            state: SessionState::Handshaking,
            idle_ready,
            ready_rx,
        }
    }

    /// Drive the session until the client disconnects, a protocol violation
    /// occurs or closure is requested through the handle.
    pub async fn run(mut self) {
        self.transition(SessionState::AwaitingStart);
        let cancel = self.handle.cancel_token().clone();

        let reason: String = loop {
            let step = {
                let Self {
                    io,
                    raw_buffer,
                    ready_rx,
                    ..
                } = &mut self;
                tokio::select! {
                    _ = cancel.cancelled() => Step::Cancelled,
                    changed = ready_rx.changed() => match changed {
                        Ok(()) => Step::ReadyChanged,
                        Err(_) => Step::ReadyClosed,
                    },
                    read = io.read_buf(raw_buffer) => match read {
                        Ok(0) => Step::Eof,
                        Ok(_) => Step::Read,
                        Err(e) => Step::SocketError(e),
                    },
                }
            };

            match step {
                Step::Cancelled => {
                    break self
                        .handle
                        .close_reason()
                        .unwrap_or_else(|| "closed".to_string());
                }
                Step::ReadyChanged => self.on_ready_changed().await,
                // The link task exited and dropped its watch; fall back to
                // the idle watch so the loop keeps a valid receiver. The
                // next audio chunk reconnects.
                Step::ReadyClosed => {
                    self.ready_rx = self.idle_ready.subscribe();
                    if self.state == SessionState::UpstreamReady
                        || self.state == SessionState::UpstreamConnecting
                    {
                        self.transition(SessionState::Streaming);
                    }
                }
                Step::Read => {
                    if let Some(reason) = self.process_buffer().await {
                        break reason;
                    }
                }
                Step::Eof => break "client closed".to_string(),
                Step::SocketError(e) => {
                    warn!(session_id = %self.handle.id(), error = %e, "media socket error");
                    break "socket error".to_string();
                }
            }
        };

        self.shutdown(&reason).await;
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(
                session_id = %self.handle.id(),
                from = ?self.state,
                to = ?next,
                "session state change"
            );
            self.state = next;
        }
    }

    /// Drain every complete frame currently buffered. Returns a close
    /// reason once the session must terminate.
    async fn process_buffer(&mut self) -> Option<String> {
        loop {
            match frame::decode(&mut self.raw_buffer) {
                Ok(Some(frame)) => {
                    if let Some(reason) = self.handle_frame(frame).await {
                        return Some(reason);
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(session_id = %self.handle.id(), error = %e, "inbound framing violation");
                    return Some("protocol error".to_string());
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Option<String> {
        if !frame.fin {
            warn!(session_id = %self.handle.id(), "fragmented frame received; ignoring");
            return None;
        }

        match frame.opcode {
            Opcode::Text => self.handle_text(&frame.payload).await,
            Opcode::Binary => {
                // Control and audio both arrive as JSON text frames.
                warn!(
                    session_id = %self.handle.id(),
                    bytes = frame.payload.len(),
                    "binary frame received; ignoring"
                );
                None
            }
            Opcode::Close => Some("received close".to_string()),
            Opcode::Ping => {
                let pong = frame::encode(Opcode::Pong, &frame.payload);
                if let Err(e) = self.io.write_all(&pong).await {
                    warn!(session_id = %self.handle.id(), error = %e, "failed to send pong");
                    return Some("socket error".to_string());
                }
                None
            }
            Opcode::Pong | Opcode::Continuation => None,
            Opcode::Other(code) => {
                warn!(session_id = %self.handle.id(), opcode = code, "unsupported opcode");
                None
            }
        }
    }

    async fn handle_text(&mut self, payload: &[u8]) -> Option<String> {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %self.handle.id(), error = %e, "non-utf8 text frame; dropping");
                return None;
            }
        };

        let event = match InboundEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(session_id = %self.handle.id(), error = %e, "failed to parse client message");
                return None;
            }
        };

        match event {
            InboundEvent::Start { call_id, stream_id } => {
                if let Some(stream_id) = stream_id {
                    self.handle.set_stream_id(stream_id);
                }
                if let Some(call_id) = call_id {
                    self.registry.attach(&self.handle, &call_id);
                }
                info!(
                    session_id = %self.handle.id(),
                    call_id = ?self.handle.call_id(),
                    stream_id = ?self.handle.stream_id(),
                    "media stream started"
                );
                if self.state == SessionState::AwaitingStart {
                    self.transition(SessionState::Streaming);
                }
                self.ensure_upstream();
                None
            }
            InboundEvent::Media { audio } => {
                // Audio ahead of the start event is held in the backlog;
                // the link only opens once start binds the session, and the
                // early chunks flush with everything else on readiness.
                if self.state == SessionState::AwaitingStart {
                    if !audio.is_empty() {
                        self.buffer_audio(audio);
                    }
                    return None;
                }
                self.forward_audio(audio).await;
                None
            }
            InboundEvent::Stop { event } => Some(format!("client event: {event}")),
            InboundEvent::Ignored => None,
            InboundEvent::Unknown { event } => {
                info!(session_id = %self.handle.id(), event = ?event, "unhandled client event");
                None
            }
        }
    }

    /// Send one audio chunk upstream, or queue it while the link is still
    /// connecting. Queued chunks are always drained before the new chunk so
    /// arrival order is preserved on every path.
    async fn forward_audio(&mut self, audio: Bytes) {
        if audio.is_empty() {
            return;
        }
        if !self.upstream_config.enabled() {
            debug!(session_id = %self.handle.id(), "transcription disabled; dropping audio");
            return;
        }

        self.ensure_upstream();
        let ready = self
            .upstream
            .as_ref()
            .is_some_and(UpstreamLink::is_ready);
        if !ready {
            self.buffer_audio(audio);
            return;
        }

        self.transition(SessionState::UpstreamReady);
        self.flush_pending().await;
        if let Some(link) = &self.upstream
            && let Err(e) = link.send_audio(audio).await
        {
            warn!(session_id = %self.handle.id(), error = %e, "failed to queue audio upstream");
        }
    }

    /// Spawn the upstream link if absent or dead. Duplicate-creation safe.
    fn ensure_upstream(&mut self) {
        if !self.upstream_config.enabled() || self.handle.is_closed() {
            return;
        }
        if let Some(link) = &self.upstream {
            if !link.is_terminated() {
                return;
            }
            warn!(session_id = %self.handle.id(), "upstream link lost; reconnecting");
        }

        let link = UpstreamLink::spawn(
            self.upstream_config.clone(),
            self.handle.clone(),
            self.sink.clone(),
        );
        self.ready_rx = link.ready_watch();
        self.upstream = Some(link);
        self.transition(SessionState::UpstreamConnecting);
    }

    async fn on_ready_changed(&mut self) {
        let ready = *self.ready_rx.borrow_and_update();
        if ready {
            self.transition(SessionState::UpstreamReady);
            self.flush_pending().await;
        } else if self.state == SessionState::UpstreamReady {
            // The link signalled not-ready on its way out; reconnect
            // happens on the next audio chunk.
            self.transition(SessionState::Streaming);
        }
    }

    fn buffer_audio(&mut self, audio: Bytes) {
        if self.pending_audio.len() >= MAX_PENDING_AUDIO_CHUNKS {
            warn!(
                session_id = %self.handle.id(),
                "audio backlog full while upstream not ready; dropping chunk"
            );
            return;
        }
        self.pending_audio.push_back(audio);
    }

    /// Flush the audio backlog in arrival order. No-op unless the link
    /// exists; chunks are drained exactly once.
    async fn flush_pending(&mut self) {
        if self.pending_audio.is_empty() {
            return;
        }
        let Some(link) = &self.upstream else {
            return;
        };
        let chunks = self.pending_audio.len();
        while let Some(chunk) = self.pending_audio.pop_front() {
            if let Err(e) = link.send_audio(chunk).await {
                warn!(session_id = %self.handle.id(), error = %e, "failed to flush buffered audio");
                break;
            }
        }
        debug!(session_id = %self.handle.id(), chunks, "flushed buffered audio upstream");
    }

    async fn shutdown(mut self, reason: &str) {
        self.transition(SessionState::Closing);
        self.handle.close(reason);
        self.registry.detach(&self.handle);
        self.pending_audio.clear();

        if let Some(link) = self.upstream.take() {
            link.stop(reason).await;
        }

        let close_frame = frame::encode(Opcode::Close, &[]);
        let _ = self.io.write_all(&close_frame).await;
        let _ = self.io.shutdown().await;

        self.transition(SessionState::Closed);
        info!(
            session_id = %self.handle.id(),
            call_id = ?self.handle.call_id(),
            reason,
            "session closed"
        );
    }
}
