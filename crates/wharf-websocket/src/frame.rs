//! RFC 6455 frame primitives.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Largest payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        let opcode = match value {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            _ => return None,
        };
        Some(opcode)
    }

    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// Close status codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED: u16 = 1003;
    /// Reserved, sent for frame lengths that don't fit in 63 bits.
    pub const RESERVED: u16 = 1004;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const TOO_BIG: u16 = 1009;
}

/// Violation of the framing protocol by the peer.
///
/// The connection is closed with `close_code` after any of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bits set")]
    ReservedBits,
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    #[error("frame masking doesn't match direction")]
    Masking,
    #[error("fragmented or oversized control frame")]
    ControlFrame,
    #[error("continuation frame without message")]
    UnexpectedContinuation,
    #[error("new message before previous message ended")]
    ExpectedContinuation,
    #[error("frame length out of range")]
    LengthOutOfRange,
    #[error("message too big")]
    TooBig,
    #[error("malformed close payload")]
    ClosePayload,
    #[error("invalid utf-8 in payload")]
    InvalidPayload,
}

impl ProtocolError {
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::LengthOutOfRange => close_code::RESERVED,
            ProtocolError::TooBig => close_code::TOO_BIG,
            ProtocolError::InvalidPayload => close_code::INVALID_PAYLOAD,
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

/// Write a single frame to `out`, masking the payload if a key is given.
pub fn encode_frame(
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload: &[u8],
    out: &mut BytesMut,
) {
    let length = payload.len();
    out.reserve(header_length(length, mask.is_some()) + length);

    let mut first = opcode as u8;
    if fin {
        first |= 0x80;
    }
    out.put_u8(first);

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if length <= 125 {
        out.put_u8(mask_bit | length as u8);
    } else if length <= 0xFFFF {
        out.put_u8(mask_bit | 126);
        out.put_u16(length as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(length as u64);
    }

    match mask {
        Some(key) => {
            out.put_slice(&key);
            let start = out.len();
            out.put_slice(payload);
            apply_mask(&mut out[start..], key, 0);
        }
        None => out.put_slice(payload),
    }
}

/// Size of the frame header for a payload, using the smallest length encoding.
pub fn header_length(payload_length: usize, masked: bool) -> usize {
    let extended = match payload_length {
        0..=125 => 0,
        126..=0xFFFF => 2,
        _ => 8,
    };
    let mask = if masked { 4 } else { 0 };

    2 + extended + mask
}

/// XOR `data` with the masking key, `offset` being the position of `data` in the payload.
pub fn apply_mask(data: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[(offset + i) % 4];
    }
}
