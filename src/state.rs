//! Shared application state.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::dispatch::{TranscriptSink, WebhookDispatcher};
use crate::session::registry::SessionRegistry;

/// State shared across handlers and spawned sessions.
pub struct AppState {
    pub config: RelayConfig,
    pub registry: Arc<SessionRegistry>,
    pub sink: Arc<dyn TranscriptSink>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        let sink: Arc<dyn TranscriptSink> = Arc::new(WebhookDispatcher::new(&config));
        Self::with_sink(config, sink)
    }

    /// Build state with a custom transcript sink. Tests use this to record
    /// deliveries instead of issuing HTTP calls.
    pub fn with_sink(config: RelayConfig, sink: Arc<dyn TranscriptSink>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            sink,
        })
    }
}
