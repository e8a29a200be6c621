use std::{rc::Rc, time::Instant};

use anyhow::Error;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{event, Level};
use wharf::message::Mailbox;
use wharf_http::upgrade::{ContextIo, FactoryHandle, FactoryUser, UpgradedContext};

use crate::{
    frame::{close_code, MAX_CONTROL_PAYLOAD},
    session::Outgoing,
    Groups, Liveness, OpCode, Peer, ProtocolError, Receiver, ReceiverHandler, Session,
    SubProtocol, SubProtocolFactory, Transmitter, WebSocketConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

/// A connection switched to WebSocket, driving a sub-protocol.
///
/// Once the closing handshake completes the transport is shut down, there's no way back to HTTP.
pub struct WebSocketContext {
    receiver: Receiver,
    transmitter: Transmitter,
    sub_protocol: Box<dyn SubProtocol>,
    session: Session,
    outgoing: Mailbox<Outgoing>,
    config: WebSocketConfig,
    liveness: Liveness,
    _factory: FactoryUser,

    disconnected: bool,
    flying_pings: u32,
    next_ping: Option<Instant>,
    close_sent: bool,
    close_received: bool,
    close_deadline: Option<Instant>,
}

impl WebSocketContext {
    pub(crate) fn new(
        role: Role,
        factory: FactoryHandle<dyn SubProtocolFactory>,
        groups: Option<Rc<Groups>>,
        config: WebSocketConfig,
    ) -> Self {
        // Queue messages sent before the connection is attached
        let outgoing = Mailbox::floating();
        let peer = Peer::new(outgoing.sender());
        let session = Session::new(factory.name(), peer, groups);

        Self {
            receiver: Receiver::new(role == Role::Server, config.max_message_size),
            transmitter: Transmitter::new(role == Role::Client, config.max_frame_payload),
            sub_protocol: factory.create(),
            session,
            outgoing,
            config,
            liveness: factory.liveness(),
            _factory: factory.into_user(),

            disconnected: false,
            flying_pings: 0,
            next_ping: None,
            close_sent: false,
            close_received: false,
            close_deadline: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for WebSocketContext {
    fn drop(&mut self) {
        if !self.disconnected {
            self.sub_protocol.on_disconnected(&mut self.session);
        }
    }
}

impl UpgradedContext for WebSocketContext {
    fn on_connected(&mut self, io: &mut ContextIo) -> Result<(), Error> {
        event!(Level::INFO, protocol = self.session.protocol(), "websocket connected");

        self.outgoing.set_signal(io.signal())?;
        self.schedule_ping(io);

        self.sub_protocol.on_connected(&mut self.session)
    }

    fn on_received(&mut self, io: &mut ContextIo, mut data: Bytes) -> Result<(), Error> {
        let mut received = Received::default();
        self.receiver.receive(&mut data, &mut received);

        for event in received.events {
            self.dispatch(io, event)?;
        }

        self.flush(io)
    }

    fn on_process(&mut self, io: &mut ContextIo) -> Result<(), Error> {
        let now = io.now();

        if self.close_deadline.is_some_and(|deadline| now >= deadline) {
            event!(Level::DEBUG, "peer didn't complete close in time");
            io.close();
            return Ok(());
        }

        if self.next_ping.is_some_and(|next| now >= next) {
            self.ping(io)?;
        }

        self.flush(io)
    }

    fn on_disconnected(&mut self, _io: &mut ContextIo) {
        self.disconnected = true;
        self.next_ping = None;
        self.close_deadline = None;

        self.sub_protocol.on_disconnected(&mut self.session);
        self.session.unsubscribe();

        event!(
            Level::INFO,
            protocol = self.session.protocol(),
            sent = self.transmitter.payload_total_sent(),
            read = self.receiver.payload_total_read(),
            "websocket disconnected"
        );
    }
}

impl WebSocketContext {
    fn dispatch(&mut self, io: &mut ContextIo, event: Inbound) -> Result<(), Error> {
        match event {
            Inbound::Start(opcode) => self
                .sub_protocol
                .on_message_start(&mut self.session, opcode)?,
            Inbound::Data(data) => self.sub_protocol.on_message_data(&mut self.session, data)?,
            Inbound::End => self.sub_protocol.on_message_end(&mut self.session)?,
            Inbound::Control(OpCode::Ping, payload) => {
                if !self.close_sent {
                    self.write(io, |transmitter, out| {
                        transmitter.message(OpCode::Pong, &payload, out)
                    })?;
                }
            }
            Inbound::Control(OpCode::Pong, _) => {
                event!(Level::TRACE, "pong received");
                self.flying_pings = 0;
                self.sub_protocol.on_pong_received(&mut self.session);
            }
            Inbound::Control(OpCode::Close, payload) => self.on_close(io, payload)?,
            Inbound::Control(_, _) => {}
            Inbound::Error(error) => self.fail(io, error)?,
        }

        Ok(())
    }

    fn on_close(&mut self, io: &mut ContextIo, payload: Bytes) -> Result<(), Error> {
        if self.close_received {
            return Ok(());
        }
        self.close_received = true;

        let status = match parse_close(&payload) {
            Ok(status) => status,
            Err(error) => return self.fail(io, error),
        };

        if self.close_sent {
            event!(Level::DEBUG, "close confirmed by peer");
        } else {
            let code = status.as_ref().map(|(code, _)| *code);
            event!(Level::DEBUG, ?code, "close received, replying");

            // Echo the status of the peer
            self.write(io, |transmitter, out| {
                transmitter.message(OpCode::Close, &payload, out)
            })?;
            self.begin_close(io);
        }

        io.shutdown_write()
    }

    fn fail(&mut self, io: &mut ContextIo, error: ProtocolError) -> Result<(), Error> {
        self.sub_protocol
            .on_message_error(&mut self.session, &error);
        self.send_close(io, error.close_code(), &error.to_string())
    }

    fn ping(&mut self, io: &mut ContextIo) -> Result<(), Error> {
        if self.flying_pings >= self.liveness.max_flying_pings {
            event!(
                Level::WARN,
                protocol = self.session.protocol(),
                pings = self.flying_pings,
                "peer stopped answering pings, closing"
            );

            self.next_ping = None;
            return self.send_close(io, close_code::GOING_AWAY, "");
        }

        event!(Level::TRACE, "sending ping");
        self.write(io, |transmitter, out| {
            transmitter.message(OpCode::Ping, b"", out)
        })?;
        self.flying_pings += 1;

        self.schedule_ping(io);
        Ok(())
    }

    fn schedule_ping(&mut self, io: &mut ContextIo) {
        if self.liveness.ping_interval.is_zero() || self.close_sent {
            return;
        }

        let next = io.now() + self.liveness.ping_interval;
        self.next_ping = Some(next);
        io.set_timer(next);
    }

    /// Send everything queued by sessions.
    fn flush(&mut self, io: &mut ContextIo) -> Result<(), Error> {
        while let Some(outgoing) = self.outgoing.recv() {
            self.transmit(io, outgoing)?;
        }

        Ok(())
    }

    fn transmit(&mut self, io: &mut ContextIo, outgoing: Outgoing) -> Result<(), Error> {
        if self.close_sent {
            event!(Level::TRACE, "dropping message after close");
            return Ok(());
        }

        match outgoing {
            Outgoing::Message { opcode, data } => self.write(io, |transmitter, out| {
                transmitter.message(opcode, &data, out)
            }),
            Outgoing::Start { opcode, data } => self.write(io, |transmitter, out| {
                transmitter.message_start(opcode, &data, out)
            }),
            Outgoing::Frame(data) => self.write(io, |transmitter, out| {
                transmitter.message_frame(&data, out)
            }),
            Outgoing::End(data) => self.write(io, |transmitter, out| {
                transmitter.message_end(&data, out)
            }),
            Outgoing::Ping(data) => {
                let length = data.len().min(MAX_CONTROL_PAYLOAD);
                self.write(io, |transmitter, out| {
                    transmitter.message(OpCode::Ping, &data[..length], out)
                })
            }
            Outgoing::Close { code, reason } => self.send_close(io, code, &reason),
        }
    }

    fn send_close(&mut self, io: &mut ContextIo, code: u16, reason: &str) -> Result<(), Error> {
        if self.close_sent {
            return Ok(());
        }

        event!(Level::DEBUG, code, reason, "sending close");

        let mut payload = BytesMut::with_capacity(MAX_CONTROL_PAYLOAD);
        payload.put_u16(code);
        payload.put_slice(truncate(reason, MAX_CONTROL_PAYLOAD - 2).as_bytes());

        self.write(io, |transmitter, out| {
            transmitter.message(OpCode::Close, &payload, out)
        })?;
        self.begin_close(io);

        Ok(())
    }

    fn begin_close(&mut self, io: &mut ContextIo) {
        self.close_sent = true;
        self.next_ping = None;

        let deadline = io.now() + self.config.close_timeout;
        self.close_deadline = Some(deadline);
        io.set_timer(deadline);
    }

    fn write<F>(&mut self, io: &mut ContextIo, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Transmitter, &mut BytesMut),
    {
        let mut out = BytesMut::new();
        f(&mut self.transmitter, &mut out);
        io.send(out.freeze())
    }
}

/// Decoded frames, collected before handing them to the sub-protocol.
#[derive(Default)]
struct Received {
    events: Vec<Inbound>,
}

enum Inbound {
    Start(OpCode),
    Data(Bytes),
    End,
    Control(OpCode, Bytes),
    Error(ProtocolError),
}

impl ReceiverHandler for Received {
    fn on_message_start(&mut self, opcode: OpCode) {
        self.events.push(Inbound::Start(opcode));
    }

    fn on_message_data(&mut self, data: Bytes) {
        self.events.push(Inbound::Data(data));
    }

    fn on_message_end(&mut self) {
        self.events.push(Inbound::End);
    }

    fn on_control(&mut self, opcode: OpCode, payload: Bytes) {
        self.events.push(Inbound::Control(opcode, payload));
    }

    fn on_error(&mut self, error: ProtocolError) {
        self.events.push(Inbound::Error(error));
    }
}

/// Status code and reason of a close frame, if it has any.
fn parse_close(payload: &[u8]) -> Result<Option<(u16, String)>, ProtocolError> {
    match payload {
        [] => Ok(None),
        [_] => Err(ProtocolError::ClosePayload),
        [high, low, reason @ ..] => {
            let code = u16::from_be_bytes([*high, *low]);
            if code < 1000 {
                return Err(ProtocolError::ClosePayload);
            }

            let reason =
                std::str::from_utf8(reason).map_err(|_| ProtocolError::InvalidPayload)?;
            Ok(Some((code, reason.to_string())))
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }

    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
