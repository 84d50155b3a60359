//! Relay configuration.
//!
//! Configuration is loaded from environment variables (after an optional
//! `.env` file is applied by `main`), with CLI flags overriding the listen
//! address. Unset values fall back to the defaults of the original
//! deployment: mu-law telephony audio at 8 kHz, Finnish transcription.

use std::env;

use crate::errors::ConfigError;
use crate::upstream::deepgram::DeepgramConfig;

/// Minimum supported sample rate (8kHz for telephony).
pub const MIN_SAMPLE_RATE: u32 = 8000;

/// Maximum supported sample rate (48kHz for high-quality audio).
pub const MAX_SAMPLE_RATE: u32 = 48000;

const DEFAULT_PORT: u16 = 10001;
const DEFAULT_HOST: &str = "0.0.0.0";

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen host for both the media endpoint and the control plane.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Shared token protecting the media endpoint and the control plane.
    /// `None` disables authentication.
    pub auth_token: Option<String>,
    /// Upstream transcription provider settings.
    pub upstream: DeepgramConfig,
    /// Where finalized transcripts are POSTed.
    pub transcription_webhook_url: String,
}

impl RelayConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_env("RELAY_PORT", DEFAULT_PORT)?;
        let host = env_opt("RELAY_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let auth_token = env_opt("RELAY_AUTH_TOKEN");

        let upstream = DeepgramConfig {
            api_key: env_opt("DEEPGRAM_API_KEY"),
            ws_url: trim_trailing_slash(
                env_opt("DEEPGRAM_WS_URL")
                    .unwrap_or_else(|| DeepgramConfig::default().ws_url.clone()),
            ),
            language: env_opt("DEEPGRAM_LANGUAGE").unwrap_or_else(|| "fi".to_string()),
            encoding: env_opt("DEEPGRAM_ENCODING").unwrap_or_else(|| "mulaw".to_string()),
            sample_rate: parse_env("DEEPGRAM_SAMPLE_RATE", 8000)?,
            channels: parse_env("DEEPGRAM_CHANNELS", 1)?,
        };

        let transcription_webhook_url = match env_opt("TRANSCRIPTION_WEBHOOK_URL") {
            Some(url) => trim_trailing_slash(url),
            None => {
                let base = env_opt("SERVER_BASE_URL")
                    .or_else(|| env_opt("PUBLIC_BASE_URL"))
                    .map(trim_trailing_slash)
                    .unwrap_or_else(|| {
                        let port = env_opt("PORT").unwrap_or_else(|| "10000".to_string());
                        format!("http://localhost:{port}")
                    });
                format!("{base}/transcription")
            }
        };

        let config = Self {
            host,
            port,
            auth_token,
            upstream,
            transcription_webhook_url,
        };
        config.validate()?;
        Ok(config)
    }

    /// The socket address string the server binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let rate = self.upstream.sample_rate;
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
            return Err(ConfigError::Invalid {
                name: "DEEPGRAM_SAMPLE_RATE",
                reason: format!(
                    "{rate} Hz is outside the supported range ({MIN_SAMPLE_RATE}-{MAX_SAMPLE_RATE} Hz)"
                ),
            });
        }
        if self.upstream.channels == 0 || self.upstream.channels > 2 {
            return Err(ConfigError::Invalid {
                name: "DEEPGRAM_CHANNELS",
                reason: format!("{} channels (expected 1 or 2)", self.upstream.channels),
            });
        }
        if !self.upstream.ws_url.starts_with("ws://") && !self.upstream.ws_url.starts_with("wss://")
        {
            return Err(ConfigError::Invalid {
                name: "DEEPGRAM_WS_URL",
                reason: format!("'{}' is not a ws:// or wss:// URL", self.upstream.ws_url),
            });
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            auth_token: None,
            upstream: DeepgramConfig::default(),
            transcription_webhook_url: "http://localhost:10000/transcription".to_string(),
        }
    }
}

/// Read an environment variable, treating empty/whitespace values as unset.
fn env_opt(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_opt(name) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name,
            reason: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

fn trim_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}
