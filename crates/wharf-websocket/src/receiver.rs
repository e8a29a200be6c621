use std::{cmp::min, mem};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{event, Level};

use crate::frame::{apply_mask, OpCode, ProtocolError, MAX_CONTROL_PAYLOAD};

/// Receiver of decoded frames.
///
/// Data messages arrive as `on_message_start`, any number of `on_message_data`, and
/// `on_message_end`. Control frames can arrive in between, and are delivered whole.
pub trait ReceiverHandler {
    fn on_message_start(&mut self, opcode: OpCode);

    fn on_message_data(&mut self, data: Bytes);

    fn on_message_end(&mut self);

    fn on_control(&mut self, opcode: OpCode, payload: Bytes);

    /// The stream violated the protocol, nothing further is decoded.
    fn on_error(&mut self, error: ProtocolError);
}

/// Incremental frame decoder.
pub struct Receiver {
    masking_expected: bool,
    max_message_size: usize,

    state: State,
    head: BytesMut,
    control: BytesMut,
    in_message: bool,
    message_size: usize,
    payload_total_read: usize,
}

enum State {
    Header,
    Payload(Frame),
    Error,
}

#[derive(Clone, Copy)]
struct Frame {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    length: usize,
    read: usize,
}

impl Receiver {
    /// Create a receiver, servers expect masked frames and clients expect unmasked frames.
    pub fn new(masking_expected: bool, max_message_size: usize) -> Self {
        Self {
            masking_expected,
            max_message_size,

            state: State::Header,
            head: BytesMut::new(),
            control: BytesMut::new(),
            in_message: false,
            message_size: 0,
            payload_total_read: 0,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.state, State::Error)
    }

    /// Total payload bytes decoded.
    pub fn payload_total_read(&self) -> usize {
        self.payload_total_read
    }

    pub fn reset(&mut self) {
        self.state = State::Header;
        self.head.clear();
        self.control.clear();
        self.in_message = false;
        self.message_size = 0;
    }

    /// Decode as much of `data` as possible, consuming all of it.
    pub fn receive<H: ReceiverHandler>(&mut self, data: &mut Bytes, handler: &mut H) {
        loop {
            match self.state {
                State::Error => {
                    data.clear();
                    return;
                }
                State::Header => {
                    let Some(result) = self.read_header(data) else {
                        return;
                    };

                    match result {
                        Ok(frame) => self.begin_frame(frame, handler),
                        Err(error) => self.fail(error, handler),
                    }
                }
                State::Payload(frame) => {
                    if data.is_empty() {
                        return;
                    }
                    self.read_payload(frame, data, handler);
                }
            }
        }
    }

    fn read_header(&mut self, data: &mut Bytes) -> Option<Result<Frame, ProtocolError>> {
        // The two fixed bytes announce the length of the rest of the header
        self.fill_head(data, 2);
        if self.head.len() < 2 {
            return None;
        }

        let second = self.head[1];
        let extended = match second & 0x7F {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask = if second & 0x80 != 0 { 4 } else { 0 };
        let needed = 2 + extended + mask;

        self.fill_head(data, needed);
        if self.head.len() < needed {
            return None;
        }

        let head = mem::take(&mut self.head);
        Some(self.parse_header(&head))
    }

    fn fill_head(&mut self, data: &mut Bytes, needed: usize) {
        let take = min(needed.saturating_sub(self.head.len()), data.len());
        self.head.extend_from_slice(&data.split_to(take));
    }

    fn parse_header(&self, head: &[u8]) -> Result<Frame, ProtocolError> {
        let first = head[0];
        let second = head[1];

        if first & 0x70 != 0 {
            return Err(ProtocolError::ReservedBits);
        }

        let value = first & 0x0F;
        let opcode = OpCode::from_u8(value).ok_or(ProtocolError::ReservedOpcode(value))?;

        let masked = second & 0x80 != 0;
        if masked != self.masking_expected {
            return Err(ProtocolError::Masking);
        }

        let mut cursor = &head[2..];
        let length = match second & 0x7F {
            126 => cursor.get_u16() as u64,
            127 => cursor.get_u64(),
            length => length as u64,
        };

        if length & (1 << 63) != 0 {
            return Err(ProtocolError::LengthOutOfRange);
        }
        let length = usize::try_from(length).map_err(|_| ProtocolError::TooBig)?;

        let mask = if masked {
            let mut key = [0u8; 4];
            cursor.copy_to_slice(&mut key);
            Some(key)
        } else {
            None
        };

        let frame = Frame {
            fin: first & 0x80 != 0,
            opcode,
            mask,
            length,
            read: 0,
        };
        Ok(frame)
    }

    fn begin_frame<H: ReceiverHandler>(&mut self, frame: Frame, handler: &mut H) {
        if let Err(error) = self.check_frame(&frame) {
            self.fail(error, handler);
            return;
        }

        if frame.opcode.is_control() {
            self.control.clear();
        } else if frame.opcode != OpCode::Continuation {
            self.in_message = true;
            self.message_size = 0;
            handler.on_message_start(frame.opcode);
        }

        if !frame.opcode.is_control() {
            self.message_size += frame.length;
        }

        if frame.length == 0 {
            self.end_frame(frame, handler);
        } else {
            self.state = State::Payload(frame);
        }
    }

    fn check_frame(&self, frame: &Frame) -> Result<(), ProtocolError> {
        if frame.opcode.is_control() {
            if !frame.fin || frame.length > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrame);
            }
            return Ok(());
        }

        let message_size = match (frame.opcode, self.in_message) {
            (OpCode::Continuation, false) => return Err(ProtocolError::UnexpectedContinuation),
            (OpCode::Continuation, true) => self.message_size,
            (_, true) => return Err(ProtocolError::ExpectedContinuation),
            (_, false) => 0,
        };

        if frame.length > self.max_message_size.saturating_sub(message_size) {
            return Err(ProtocolError::TooBig);
        }

        Ok(())
    }

    fn read_payload<H: ReceiverHandler>(
        &mut self,
        mut frame: Frame,
        data: &mut Bytes,
        handler: &mut H,
    ) {
        let take = min(frame.length - frame.read, data.len());
        let mut chunk = data.split_to(take);

        if let Some(key) = frame.mask {
            let mut unmasked = BytesMut::from(&chunk[..]);
            apply_mask(&mut unmasked, key, frame.read);
            chunk = unmasked.freeze();
        }

        frame.read += take;
        self.payload_total_read += take;

        if frame.opcode.is_control() {
            self.control.extend_from_slice(&chunk);
        } else {
            handler.on_message_data(chunk);
        }

        if frame.read == frame.length {
            self.end_frame(frame, handler);
        } else {
            self.state = State::Payload(frame);
        }
    }

    fn end_frame<H: ReceiverHandler>(&mut self, frame: Frame, handler: &mut H) {
        self.state = State::Header;

        if frame.opcode.is_control() {
            handler.on_control(frame.opcode, self.control.split().freeze());
        } else if frame.fin {
            self.in_message = false;
            handler.on_message_end();
        }
    }

    fn fail<H: ReceiverHandler>(&mut self, error: ProtocolError, handler: &mut H) {
        event!(Level::DEBUG, %error, "websocket protocol error");
        self.state = State::Error;
        handler.on_error(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        data: Vec<u8>,
        errors: Vec<ProtocolError>,
    }

    impl ReceiverHandler for Recorder {
        fn on_message_start(&mut self, opcode: OpCode) {
            self.calls.push(format!("start {:?}", opcode));
        }

        fn on_message_data(&mut self, data: Bytes) {
            self.data.extend_from_slice(&data);
        }

        fn on_message_end(&mut self) {
            self.calls.push("end".to_string());
        }

        fn on_control(&mut self, opcode: OpCode, payload: Bytes) {
            self.calls.push(format!(
                "control {:?} {}",
                opcode,
                String::from_utf8_lossy(&payload)
            ));
        }

        fn on_error(&mut self, error: ProtocolError) {
            self.errors.push(error);
        }
    }

    fn frame(fin: bool, opcode: OpCode, masked: bool, payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        let mask = masked.then_some([0x37, 0xfa, 0x21, 0x3d]);
        encode_frame(fin, opcode, mask, payload, &mut out);
        out
    }

    #[test]
    fn payload_sizes_survive_decoding() {
        for length in [0, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..length).map(|i| (i % 251) as u8).collect();

            for masked in [false, true] {
                let mut data = frame(true, OpCode::Binary, masked, &payload).freeze();
                let mut receiver = Receiver::new(masked, usize::MAX);
                let mut recorder = Recorder::default();

                receiver.receive(&mut data, &mut recorder);

                assert_eq!(recorder.calls, ["start Binary", "end"], "length {}", length);
                assert_eq!(recorder.data, payload);
                assert!(recorder.errors.is_empty());
            }
        }
    }

    #[test]
    fn split_delivery_decodes_the_same() {
        let mut whole = frame(false, OpCode::Text, true, b"Hello, ");
        whole.extend_from_slice(&frame(true, OpCode::Ping, true, b"are you there"));
        whole.extend_from_slice(&frame(true, OpCode::Continuation, true, b"World!"));
        let whole = whole.freeze();

        for size in 1..whole.len() {
            let mut receiver = Receiver::new(true, usize::MAX);
            let mut recorder = Recorder::default();

            for chunk in whole.chunks(size) {
                let mut chunk = Bytes::copy_from_slice(chunk);
                receiver.receive(&mut chunk, &mut recorder);
                assert!(chunk.is_empty());
            }

            assert_eq!(
                recorder.calls,
                ["start Text", "control Ping are you there", "end"],
                "split size {}",
                size
            );
            assert_eq!(recorder.data, b"Hello, World!");
        }
    }

    #[test]
    fn protocol_violations() {
        let mut long_length = BytesMut::from(&[0x82u8, 0xFF][..]);
        long_length.extend_from_slice(&[0x80, 0, 0, 0, 0, 0, 0, 0]);
        long_length.extend_from_slice(&[1, 2, 3, 4]);

        let mut long_ping = vec![0u8; 126];
        long_ping[0] = b'x';

        let cases = [
            (frame(true, OpCode::Text, false, b"unmasked"), ProtocolError::Masking),
            (
                frame(true, OpCode::Continuation, true, b"orphan"),
                ProtocolError::UnexpectedContinuation,
            ),
            (frame(false, OpCode::Ping, true, b""), ProtocolError::ControlFrame),
            (frame(true, OpCode::Ping, true, &long_ping), ProtocolError::ControlFrame),
            (BytesMut::from(&[0x83u8, 0x80, 0, 0, 0, 0][..]), ProtocolError::ReservedOpcode(3)),
            (BytesMut::from(&[0xC1u8, 0x80, 0, 0, 0, 0][..]), ProtocolError::ReservedBits),
            (long_length, ProtocolError::LengthOutOfRange),
        ];

        for (data, expected) in cases {
            let mut receiver = Receiver::new(true, usize::MAX);
            let mut recorder = Recorder::default();

            receiver.receive(&mut data.freeze(), &mut recorder);

            assert_eq!(recorder.errors, [expected.clone()]);
            assert!(receiver.is_error(), "{:?}", expected);
        }
    }

    #[test]
    fn new_message_inside_fragmented_message() {
        let mut data = frame(false, OpCode::Text, true, b"one");
        data.extend_from_slice(&frame(true, OpCode::Binary, true, b"two"));

        let mut receiver = Receiver::new(true, usize::MAX);
        let mut recorder = Recorder::default();
        receiver.receive(&mut data.freeze(), &mut recorder);

        assert_eq!(recorder.errors, [ProtocolError::ExpectedContinuation]);
    }

    #[test]
    fn message_size_limit_spans_fragments() {
        let mut data = frame(false, OpCode::Binary, true, &[0; 8]);
        data.extend_from_slice(&frame(true, OpCode::Continuation, true, &[0; 8]));

        let mut receiver = Receiver::new(true, 12);
        let mut recorder = Recorder::default();
        receiver.receive(&mut data.freeze(), &mut recorder);

        assert_eq!(recorder.calls, ["start Binary"]);
        assert_eq!(recorder.errors, [ProtocolError::TooBig]);
    }

    #[test]
    fn error_stops_decoding_until_reset() {
        let mut receiver = Receiver::new(true, usize::MAX);
        let mut recorder = Recorder::default();

        receiver.receive(&mut frame(true, OpCode::Text, false, b"x").freeze(), &mut recorder);
        receiver.receive(&mut frame(true, OpCode::Text, true, b"y").freeze(), &mut recorder);
        assert!(recorder.calls.is_empty());

        receiver.reset();
        receiver.receive(&mut frame(true, OpCode::Text, true, b"z").freeze(), &mut recorder);
        assert_eq!(recorder.calls, ["start Text", "end"]);
        assert_eq!(recorder.data, b"z");
    }
}
