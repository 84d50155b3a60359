//! Inbound control and audio events.
//!
//! Telephony providers send JSON text frames with an event discriminator
//! under `event`, `event_type` or `type`. Call and stream identifiers on
//! start events show up under several names depending on the provider and
//! fork mode, so parsing tries each known location in a fixed precedence
//! order. Audio travels base64-encoded inside `media` events.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::Deserialize;

use crate::errors::EventError;

#[derive(Debug, Default, Deserialize)]
struct StartBlock {
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    call_control_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MediaBlock {
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    stream_key: Option<String>,
    #[serde(default)]
    call_control_id: Option<String>,
    #[serde(default)]
    start: Option<StartBlock>,
    #[serde(default)]
    media: Option<MediaBlock>,
    #[serde(default)]
    payload: Option<String>,
}

/// One decoded inbound event.
#[derive(Debug, PartialEq)]
pub enum InboundEvent {
    /// Media fork started; identifiers may be partial.
    Start {
        call_id: Option<String>,
        stream_id: Option<String>,
    },
    /// Decoded audio bytes ready for forwarding.
    Media { audio: Bytes },
    /// Terminal client event (`stop`, `finished` or `close`); the carried
    /// name ends up in the session close reason.
    Stop { event: String },
    /// Recognized but requires no action (keepalive, media without payload).
    Ignored,
    /// Unrecognized event discriminator, logged by the caller.
    Unknown { event: Option<String> },
}

impl InboundEvent {
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let raw: RawEvent = serde_json::from_str(text)?;
        let event = raw
            .event
            .clone()
            .or_else(|| raw.event_type.clone())
            .or_else(|| raw.kind.clone());

        match event.as_deref() {
            Some("start") => {
                let start = raw.start.unwrap_or_default();
                let call_id = raw
                    .call_id
                    .or(raw.stream_key)
                    .or(raw.call_control_id)
                    .or(start.call_id)
                    .or(start.call_control_id);
                Ok(InboundEvent::Start {
                    call_id,
                    stream_id: raw.stream_id,
                })
            }
            Some("media") => {
                let payload = raw.media.and_then(|m| m.payload).or(raw.payload);
                match payload {
                    Some(payload) => Ok(InboundEvent::Media {
                        audio: Bytes::from(BASE64.decode(payload)?),
                    }),
                    None => Ok(InboundEvent::Ignored),
                }
            }
            Some(name @ ("stop" | "finished" | "close")) => Ok(InboundEvent::Stop {
                event: name.to_string(),
            }),
            Some("keepalive") => Ok(InboundEvent::Ignored),
            other => Ok(InboundEvent::Unknown {
                event: other.map(str::to_string),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_with_top_level_call_id() {
        let event =
            InboundEvent::parse(r#"{"event":"start","call_id":"CALL1","stream_id":"s-1"}"#)
                .unwrap();
        assert_eq!(
            event,
            InboundEvent::Start {
                call_id: Some("CALL1".to_string()),
                stream_id: Some("s-1".to_string()),
            }
        );
    }

    #[test]
    fn start_call_id_precedence_and_fallbacks() {
        // call_id beats the nested start block.
        let event = InboundEvent::parse(
            r#"{"event":"start","call_id":"TOP","start":{"call_id":"NESTED"}}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            InboundEvent::Start { call_id: Some(id), .. } if id == "TOP"
        ));

        for body in [
            r#"{"event":"start","stream_key":"FALLBACK"}"#,
            r#"{"event":"start","call_control_id":"FALLBACK"}"#,
            r#"{"event":"start","start":{"call_id":"FALLBACK"}}"#,
            r#"{"event":"start","start":{"call_control_id":"FALLBACK"}}"#,
        ] {
            let event = InboundEvent::parse(body).unwrap();
            assert!(
                matches!(
                    event,
                    InboundEvent::Start { call_id: Some(ref id), .. } if id == "FALLBACK"
                ),
                "no call id extracted from {body}"
            );
        }

        let event = InboundEvent::parse(r#"{"event":"start"}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::Start {
                call_id: None,
                stream_id: None,
            }
        );
    }

    #[test]
    fn event_discriminator_aliases() {
        for body in [
            r#"{"event":"start"}"#,
            r#"{"event_type":"start"}"#,
            r#"{"type":"start"}"#,
        ] {
            assert!(matches!(
                InboundEvent::parse(body).unwrap(),
                InboundEvent::Start { .. }
            ));
        }
    }

    #[test]
    fn media_decodes_base64_payload() {
        let event =
            InboundEvent::parse(r#"{"event":"media","media":{"payload":"AAA="}}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::Media {
                audio: Bytes::from_static(&[0x00, 0x00]),
            }
        );

        // Top-level payload fallback.
        let event = InboundEvent::parse(r#"{"event":"media","payload":"BBB="}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::Media {
                audio: Bytes::from_static(&[0x04, 0x10]),
            }
        );
    }

    #[test]
    fn media_without_payload_is_ignored() {
        assert_eq!(
            InboundEvent::parse(r#"{"event":"media"}"#).unwrap(),
            InboundEvent::Ignored
        );
        assert_eq!(
            InboundEvent::parse(r#"{"event":"keepalive"}"#).unwrap(),
            InboundEvent::Ignored
        );
    }

    #[test]
    fn terminal_events_carry_their_name() {
        for name in ["stop", "finished", "close"] {
            let event = InboundEvent::parse(&format!(r#"{{"event":"{name}"}}"#)).unwrap();
            assert_eq!(
                event,
                InboundEvent::Stop {
                    event: name.to_string(),
                }
            );
        }
    }

    #[test]
    fn unknown_and_invalid_inputs() {
        assert_eq!(
            InboundEvent::parse(r#"{"event":"mark"}"#).unwrap(),
            InboundEvent::Unknown {
                event: Some("mark".to_string()),
            }
        );
        assert_eq!(
            InboundEvent::parse(r#"{"foo":1}"#).unwrap(),
            InboundEvent::Unknown { event: None }
        );
        assert!(InboundEvent::parse("not json").is_err());
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"media","media":{"payload":"!!!"}}"#),
            Err(EventError::Base64(_))
        ));
    }
}
