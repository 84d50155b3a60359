//! Inbound streaming-socket protocol: upgrade handshake and frame codec.

pub mod frame;
pub mod handshake;

pub use frame::{Frame, MAX_FRAME_PAYLOAD, Opcode, apply_mask, decode, encode};
pub use handshake::{WEBSOCKET_GUID, accept_key};
