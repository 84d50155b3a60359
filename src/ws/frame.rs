//! Manual WebSocket frame codec for the inbound media connection.
//!
//! The decode side operates incrementally over the session's accumulation
//! buffer: a frame is consumed only once the header, masking key and full
//! payload are present, otherwise the buffer is left untouched for the next
//! delivery. Inbound frames must carry the MASK bit; an unmasked frame is a
//! protocol violation that terminates the session.
//!
//! The encode side produces server-to-client frames (FIN set, no mask) and
//! is used for pong replies and the closing handshake.

use bytes::{Buf, Bytes, BytesMut};

use crate::errors::ProtocolError;

/// Maximum accepted payload for a single inbound frame (10 MiB).
///
/// Telephony media messages are small JSON texts; anything near this limit
/// indicates a misbehaving peer rather than legitimate traffic.
pub const MAX_FRAME_PAYLOAD: usize = 10 * 1024 * 1024;

/// WebSocket frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Reserved or unknown opcode; logged and ignored by the session.
    Other(u8),
}

impl Opcode {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Other(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Other(other) => other & 0x0F,
        }
    }
}

/// A single decoded frame. The payload is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Attempt to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// in that case nothing is consumed. On success the frame's bytes are
/// removed from the buffer, so repeated calls drain back-to-back frames.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let second = buf[1];
    let fin = first & 0x80 != 0;
    let opcode = Opcode::from_bits(first & 0x0F);
    let masked = second & 0x80 != 0;

    let (payload_len, header_len) = match second & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4usize)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(len_bytes), 10usize)
        }
        short => (u64::from(short), 2usize),
    };

    if !masked {
        return Err(ProtocolError::UnmaskedFrame);
    }
    if payload_len > MAX_FRAME_PAYLOAD as u64 {
        return Err(ProtocolError::FrameTooLarge(payload_len));
    }
    let payload_len = payload_len as usize;

    if buf.len() < header_len + 4 + payload_len {
        return Ok(None);
    }

    buf.advance(header_len);
    let mut key = [0u8; 4];
    key.copy_from_slice(&buf[..4]);
    buf.advance(4);

    let mut payload = buf.split_to(payload_len);
    apply_mask(&mut payload, key);

    Ok(Some(Frame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

/// XOR `data` with the 4-byte masking key cycled by index. Applying the
/// same key twice restores the original bytes.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode a server-to-client frame (FIN set, unmasked payload).
pub fn encode(opcode: Opcode, payload: &[u8]) -> Bytes {
    let len = payload.len();
    let mut out = BytesMut::with_capacity(10 + len);

    out.extend_from_slice(&[0x80 | opcode.bits()]);
    if len < 126 {
        out.extend_from_slice(&[len as u8]);
    } else if len < 65536 {
        out.extend_from_slice(&[126]);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&[127]);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out.freeze()
}
