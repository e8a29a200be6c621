use std::{collections::VecDeque, io::ErrorKind, mem, rc::Rc};

use anyhow::Error;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use tracing::{event, span, Level, Span};
use uuid::Uuid;
use wharf::{
    message::{Mailbox, Sender},
    Actor, Meta, Signal, World,
};
use wharf_mio::net::tcp::{SendAction, StreamAction, StreamEvent};

use crate::{
    message::{closes_after, ConnectionState, Version},
    parser::{ParserHandler, RequestParser, Status},
    response::{http_date, ResponseAction},
    server::{HttpEvent, RequestEvent, ServerConfig},
    status::reason_or_unknown,
    upgrade::{ContextIo, Upgraded},
    ParseError, Request, Response,
};

pub enum ConnectionEvent {
    Closed,
}

pub enum ConnectionAction {
    Close,
}

/// Open an HTTP server connection on an established stream.
pub fn open(
    world: &mut World,
    tcp_events: Mailbox<StreamEvent>,
    tcp_actions: Sender<StreamAction>,
    config: Rc<ServerConfig>,
    events: Sender<ConnectionEvent>,
    http_events: Sender<HttpEvent>,
) -> Result<Sender<ConnectionAction>, Error> {
    let actor = Service::new(tcp_events, tcp_actions, config, events, http_events);
    let actions = actor.actions.sender();
    world.insert("http-connection", actor)?;

    Ok(actions)
}

struct Service {
    actions: Mailbox<ConnectionAction>,
    events: Sender<ConnectionEvent>,
    tcp_events: Mailbox<StreamEvent>,
    tcp_actions: Sender<StreamAction>,
    http_events: Sender<HttpEvent>,
    config: Rc<ServerConfig>,
    span: Span,

    tcp_closed: bool,
    protocol: Protocol,
}

enum Protocol {
    Http(HttpState),
    Upgraded(Upgraded),
    Closed,
}

struct HttpState {
    parser: RequestParser,
    buffer: BytesMut,
    requests: VecDeque<PendingRequest>,
    /// Parsing waits for the answer to an upgrade request.
    paused: bool,
    closing: bool,
}

struct PendingRequest {
    version: Version,
    connection: ConnectionState,
    state: RequestState,
}

enum RequestState {
    Pending { actions: Mailbox<ResponseAction> },
    Error(ParseError),
}

/// What to do with the connection after draining responses.
enum Step {
    Wait,
    Switch(Upgraded),
    Stop,
}

impl Service {
    fn new(
        tcp_events: Mailbox<StreamEvent>,
        tcp_actions: Sender<StreamAction>,
        config: Rc<ServerConfig>,
        events: Sender<ConnectionEvent>,
        http_events: Sender<HttpEvent>,
    ) -> Self {
        let span = span!(Level::INFO, "http-connection", id = %Uuid::new_v4());
        event!(parent: &span, Level::DEBUG, "connection opened");

        let http = HttpState {
            parser: RequestParser::new(config.http.clone()),
            buffer: BytesMut::new(),
            requests: VecDeque::new(),
            paused: false,
            closing: false,
        };

        Self {
            actions: Mailbox::default(),
            events,
            tcp_events,
            tcp_actions,
            http_events,
            config,
            span,

            tcp_closed: false,
            protocol: Protocol::Http(http),
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        event!(Level::DEBUG, "closing");

        let _ = self.events.send(ConnectionEvent::Closed);
        if !self.tcp_closed {
            let _ = self.tcp_actions.send(StreamAction::Close);
        }

        // Release the upgraded context before removing factories without users
        self.protocol = Protocol::Closed;
        if let Some(upgrades) = &self.config.upgrades {
            upgrades.collect();
        }
    }
}

impl Actor for Service {
    fn register(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        self.tcp_events.set_signal(meta.signal())?;
        self.actions.set_signal(meta.signal())?;
        Ok(())
    }

    fn process(&mut self, world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        let span = self.span.clone();
        let _entered = span.enter();

        self.process_tcp(world, meta)?;

        // Can't do anything further if we don't have an open TCP connection
        if self.tcp_closed {
            return Ok(());
        }

        while let Some(action) = self.actions.recv() {
            match action {
                ConnectionAction::Close => {
                    event!(Level::DEBUG, "close requested");
                    meta.set_stop();
                    return Ok(());
                }
            }
        }

        if let Protocol::Upgraded(upgraded) = &mut self.protocol {
            let mut io = ContextIo::new(world, meta.signal(), &self.tcp_actions);
            upgraded.context.on_process(&mut io)?;

            if io.close_requested() {
                meta.set_stop();
            }

            return Ok(());
        }

        self.process_http(world, meta)
    }
}

impl Service {
    fn process_tcp(&mut self, world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        while let Some(event) = self.tcp_events.recv() {
            match event {
                StreamEvent::Recv(event) => {
                    event!(Level::TRACE, bytes = event.data.len(), "received data");
                    self.handle_recv(world, meta, event.data)?;
                }
                StreamEvent::Error(kind) => log_stream_error(kind),
                StreamEvent::Closed => {
                    event!(Level::DEBUG, "stream closed");

                    match &mut self.protocol {
                        Protocol::Http(http) => {
                            // Requests that arrived together with the close still get delivered
                            http.parse(&self.config, meta.signal(), &self.http_events)?;
                        }
                        Protocol::Upgraded(upgraded) => {
                            let mut io = ContextIo::new(world, meta.signal(), &self.tcp_actions);
                            upgraded.context.on_disconnected(&mut io);
                        }
                        Protocol::Closed => {}
                    }

                    self.tcp_closed = true;
                    meta.set_stop();
                }
            }
        }

        Ok(())
    }

    fn handle_recv(&mut self, world: &mut World, meta: &mut Meta, data: Bytes) -> Result<(), Error> {
        match &mut self.protocol {
            Protocol::Http(http) => {
                // Parsing happens when processing, after every event is received
                http.buffer.extend_from_slice(&data);
            }
            Protocol::Upgraded(upgraded) => {
                let mut io = ContextIo::new(world, meta.signal(), &self.tcp_actions);
                upgraded.context.on_received(&mut io, data)?;

                if io.close_requested() {
                    meta.set_stop();
                }
            }
            Protocol::Closed => {}
        }

        Ok(())
    }

    fn process_http(&mut self, world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        let Protocol::Http(http) = &mut self.protocol else {
            return Ok(());
        };

        http.parse(&self.config, meta.signal(), &self.http_events)?;
        let step = http.drain_responses(&self.tcp_actions, &meta.signal())?;

        match step {
            Step::Wait => {}
            Step::Stop => meta.set_stop(),
            Step::Switch(upgraded) => {
                let leftover = mem::take(&mut http.buffer).freeze();
                self.switch(world, meta, upgraded, leftover)?;
            }
        }

        Ok(())
    }

    fn switch(
        &mut self,
        world: &mut World,
        meta: &mut Meta,
        upgraded: Upgraded,
        leftover: Bytes,
    ) -> Result<(), Error> {
        event!(Level::DEBUG, protocol = %upgraded.protocol, "switched protocol");

        self.protocol = Protocol::Upgraded(upgraded);
        let Protocol::Upgraded(upgraded) = &mut self.protocol else {
            return Ok(());
        };

        let mut io = ContextIo::new(world, meta.signal(), &self.tcp_actions);
        upgraded.context.on_connected(&mut io)?;

        // Data the peer sent right after the upgrade request belongs to the new protocol
        if !leftover.is_empty() && !io.close_requested() {
            upgraded.context.on_received(&mut io, leftover)?;
        }

        if io.close_requested() {
            meta.set_stop();
        }

        Ok(())
    }
}

impl HttpState {
    /// Parse buffered data, delivering every complete request.
    fn parse(
        &mut self,
        config: &ServerConfig,
        signal: Signal,
        http_events: &Sender<HttpEvent>,
    ) -> Result<(), Error> {
        if self.paused || self.closing || self.parser.is_error() {
            return Ok(());
        }

        let mut data = mem::take(&mut self.buffer).freeze();
        let mut parsed = Parsed::default();

        while !data.is_empty() {
            let status = self.parser.parse(&mut data, &mut parsed);

            match status {
                Status::Complete => {
                    // Bytes after an upgrade request may not be HTTP anymore
                    if let Some(Ok(request)) = parsed.messages.last() {
                        if request.is_upgrade() {
                            self.paused = true;
                            break;
                        }
                    }
                }
                Status::Incomplete | Status::Error => break,
            }
        }

        self.buffer.extend_from_slice(&data);

        for message in parsed.messages {
            let request = match message {
                Ok(request) => request,
                Err(error) => {
                    let pending = PendingRequest {
                        version: Version::HTTP_1_1,
                        connection: ConnectionState::Close,
                        state: RequestState::Error(error),
                    };
                    self.requests.push_back(pending);
                    continue;
                }
            };

            event!(
                Level::DEBUG,
                method = %request.method,
                url = %request.url,
                "received request"
            );

            let actions = Mailbox::default();
            actions.set_signal(signal.clone())?;

            let response = Response::new(actions.sender(), config.upgrades.clone(), &request);
            let pending = PendingRequest {
                version: request.version,
                connection: request.connection,
                state: RequestState::Pending { actions },
            };
            self.requests.push_back(pending);

            let event = RequestEvent { request, response };
            http_events.send(HttpEvent::Request(event))?;
        }

        Ok(())
    }

    /// Send the responses of requests in order, only the front request can be answered.
    fn drain_responses(
        &mut self,
        tcp_actions: &Sender<StreamAction>,
        signal: &Signal,
    ) -> Result<Step, Error> {
        let Some(front) = self.requests.front() else {
            return Ok(Step::Wait);
        };

        let actions = match &front.state {
            RequestState::Pending { actions } => actions,
            RequestState::Error(error) => {
                event!(Level::DEBUG, code = error.code, reason = %error.reason, "answering parse error");

                let data = error_response(error);
                tcp_actions.send(StreamAction::Send(SendAction { data }))?;
                self.shutdown(tcp_actions)?;

                return Ok(Step::Wait);
            }
        };

        while let Some(action) = actions.recv() {
            match action {
                ResponseAction::Data(data) => {
                    tcp_actions.send(StreamAction::Send(SendAction { data }))?;
                }
                ResponseAction::Completed { connection } => {
                    let close = closes_after(front.version, front.connection, connection);
                    self.requests.pop_front();

                    if close {
                        event!(Level::DEBUG, "response completed, closing");
                        self.shutdown(tcp_actions)?;
                    } else {
                        // Continue with the next request on the next tick
                        event!(Level::TRACE, "response completed, keeping alive");
                        self.paused = false;
                        signal.send()?;
                    }

                    return Ok(Step::Wait);
                }
                ResponseAction::Terminate => {
                    event!(Level::DEBUG, "response terminated");
                    return Ok(Step::Stop);
                }
                ResponseAction::Upgrade(upgraded) => {
                    self.requests.clear();
                    return Ok(Step::Switch(upgraded));
                }
            }
        }

        Ok(Step::Wait)
    }

    fn shutdown(&mut self, tcp_actions: &Sender<StreamAction>) -> Result<(), Error> {
        self.closing = true;
        self.requests.clear();
        tcp_actions.send(StreamAction::Shutdown)?;
        Ok(())
    }
}

#[derive(Default)]
struct Parsed {
    messages: Vec<Result<Request, ParseError>>,
}

impl ParserHandler<Request> for Parsed {
    fn on_message(&mut self, message: Request) {
        self.messages.push(Ok(message));
    }

    fn on_error(&mut self, error: ParseError) {
        self.messages.push(Err(error));
    }
}

/// Synthetic response to a malformed request.
fn error_response(error: &ParseError) -> Bytes {
    let mut data = BytesMut::new();

    let head = format!(
        "HTTP/1.1 {} {}\r\nDate: {}\r\nConnection: close\r\n\
         Content-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
        error.code,
        reason_or_unknown(error.code),
        http_date(Utc::now()),
        error.reason.len(),
    );
    data.put(head.as_bytes());
    data.put(error.reason.as_bytes());

    data.freeze()
}

pub(crate) fn log_stream_error(kind: ErrorKind) {
    // A peer resetting the connection is a normal way to disconnect
    if kind == ErrorKind::ConnectionReset {
        event!(Level::DEBUG, ?kind, "connection reset by peer");
    } else {
        event!(Level::WARN, ?kind, "stream error");
    }
}
