use std::cmp::min;

use bytes::BytesMut;

use crate::frame::{encode_frame, OpCode};

/// Frame encoder, splitting messages into frames.
///
/// Only the first frame of a message carries its opcode, and only the last frame of a completed
/// message has the fin bit set.
pub struct Transmitter {
    masking: bool,
    max_frame_payload: usize,
    payload_total_sent: usize,
}

impl Transmitter {
    /// Create a transmitter, clients mask frames and servers don't.
    pub fn new(masking: bool, max_frame_payload: usize) -> Self {
        Self {
            masking,
            max_frame_payload: max_frame_payload.max(1),
            payload_total_sent: 0,
        }
    }

    /// Total payload bytes encoded.
    pub fn payload_total_sent(&self) -> usize {
        self.payload_total_sent
    }

    /// Encode a complete message.
    pub fn message(&mut self, opcode: OpCode, payload: &[u8], out: &mut BytesMut) {
        self.send(true, opcode, payload, out);
    }

    /// Encode the start of a message, to be continued by `message_frame` and `message_end`.
    pub fn message_start(&mut self, opcode: OpCode, payload: &[u8], out: &mut BytesMut) {
        self.send(false, opcode, payload, out);
    }

    pub fn message_frame(&mut self, payload: &[u8], out: &mut BytesMut) {
        self.send(false, OpCode::Continuation, payload, out);
    }

    pub fn message_end(&mut self, payload: &[u8], out: &mut BytesMut) {
        self.send(true, OpCode::Continuation, payload, out);
    }

    fn send(&mut self, end: bool, mut opcode: OpCode, payload: &[u8], out: &mut BytesMut) {
        let mut offset = 0;

        // An empty payload still sends one frame
        loop {
            let length = min(payload.len() - offset, self.max_frame_payload);
            let last = offset + length == payload.len();

            let mask = self.masking.then(|| fastrand::u32(..).to_be_bytes());
            encode_frame(
                last && end,
                opcode,
                mask,
                &payload[offset..offset + length],
                out,
            );

            offset += length;
            opcode = OpCode::Continuation;

            if last {
                break;
            }
        }

        self.payload_total_sent += payload.len();
    }
}
