//! Upstream transcription providers.

pub mod deepgram;
