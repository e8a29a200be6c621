use std::{collections::VecDeque, mem, net::SocketAddr, rc::Rc};

use anyhow::Error;
use bytes::{Bytes, BytesMut};
use tracing::{event, instrument, span, Level, Span};
use uuid::Uuid;
use wharf::{
    message::{Mailbox, Sender},
    Actor, Meta, World,
};
use wharf_mio::{
    net::tcp::{self, SendAction, StreamAction, StreamEvent},
    Registry,
};

use crate::{
    client::{ClientAction, ClientConfig, ClientEvent},
    parser::{ParserHandler, ResponseParser, Status},
    server::log_stream_error,
    upgrade::{ContextIo, Upgraded},
    ClientRequest, ClientResponse, ParseError,
};

/// Connect to an HTTP server.
#[instrument("http::connect", skip_all)]
pub fn connect(
    world: &mut World,
    registry: Rc<Registry>,
    addr: SocketAddr,
    config: ClientConfig,
    events: Sender<ClientEvent>,
) -> Result<Sender<ClientAction>, Error> {
    let connected = tcp::connect(world, registry, addr)?;
    open(world, connected.events, connected.actions, config, events)
}

/// Open an HTTP client connection on an established stream.
pub fn open(
    world: &mut World,
    tcp_events: Mailbox<StreamEvent>,
    tcp_actions: Sender<StreamAction>,
    config: ClientConfig,
    events: Sender<ClientEvent>,
) -> Result<Sender<ClientAction>, Error> {
    let actor = Service::new(tcp_events, tcp_actions, config, events);
    let actions = actor.actions.sender();
    world.insert("http-client", actor)?;

    Ok(actions)
}

struct Service {
    actions: Mailbox<ClientAction>,
    events: Sender<ClientEvent>,
    tcp_events: Mailbox<StreamEvent>,
    tcp_actions: Sender<StreamAction>,
    config: ClientConfig,
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
    parser: ResponseParser,
    buffer: BytesMut,
    /// Sent requests waiting for their response, in order.
    pending: VecDeque<ClientRequest>,
}

enum Step {
    Continue,
    Switch(Upgraded),
    Stop,
}

impl Service {
    fn new(
        tcp_events: Mailbox<StreamEvent>,
        tcp_actions: Sender<StreamAction>,
        config: ClientConfig,
        events: Sender<ClientEvent>,
    ) -> Self {
        let span = span!(Level::INFO, "http-client", id = %Uuid::new_v4());

        let http = HttpState {
            parser: ResponseParser::new(config.http.clone()),
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
        };

        Self {
            actions: Mailbox::default(),
            events,
            tcp_events,
            tcp_actions,
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

        let _ = self.events.send(ClientEvent::Closed);
        if !self.tcp_closed {
            let _ = self.tcp_actions.send(StreamAction::Close);
        }

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
        if self.tcp_closed {
            return Ok(());
        }

        self.process_actions(meta)?;

        match &mut self.protocol {
            Protocol::Upgraded(upgraded) => {
                let mut io = ContextIo::new(world, meta.signal(), &self.tcp_actions);
                upgraded.context.on_process(&mut io)?;

                if io.close_requested() {
                    meta.set_stop();
                }
            }
            Protocol::Http(http) => {
                let step = http.parse(&self.events)?;
                self.apply(world, meta, step)?;
            }
            Protocol::Closed => {}
        }

        Ok(())
    }
}

impl Service {
    fn process_tcp(&mut self, world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        while let Some(event) = self.tcp_events.recv() {
            match event {
                StreamEvent::Recv(event) => match &mut self.protocol {
                    Protocol::Http(http) => http.buffer.extend_from_slice(&event.data),
                    Protocol::Upgraded(upgraded) => {
                        let mut io = ContextIo::new(world, meta.signal(), &self.tcp_actions);
                        upgraded.context.on_received(&mut io, event.data)?;

                        if io.close_requested() {
                            meta.set_stop();
                        }
                    }
                    Protocol::Closed => {}
                },
                StreamEvent::Error(kind) => log_stream_error(kind),
                StreamEvent::Closed => {
                    event!(Level::DEBUG, "stream closed");

                    match &mut self.protocol {
                        Protocol::Http(http) => {
                            // Data received together with the close is parsed before it
                            if let Step::Continue = http.parse(&self.events)? {
                                http.finish(&self.events)?;
                            }
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

    fn process_actions(&mut self, meta: &mut Meta) -> Result<(), Error> {
        while let Some(action) = self.actions.recv() {
            match action {
                ClientAction::Send(request) => {
                    let Protocol::Http(http) = &mut self.protocol else {
                        event!(Level::WARN, "dropping request on upgraded connection");
                        continue;
                    };

                    event!(Level::DEBUG, method = %request.method, url = %request.url, "sending request");

                    let data = request.to_bytes();
                    self.tcp_actions
                        .send(StreamAction::Send(SendAction { data }))?;
                    http.pending.push_back(request);
                }
                ClientAction::Close => {
                    event!(Level::DEBUG, "close requested");
                    meta.set_stop();
                }
            }
        }

        Ok(())
    }

    fn apply(&mut self, world: &mut World, meta: &mut Meta, step: Step) -> Result<(), Error> {
        match step {
            Step::Continue => {}
            Step::Stop => meta.set_stop(),
            Step::Switch(upgraded) => {
                let leftover = match &mut self.protocol {
                    Protocol::Http(http) => mem::take(&mut http.buffer).freeze(),
                    _ => Bytes::new(),
                };

                self.events.send(ClientEvent::Upgraded {
                    protocol: upgraded.protocol.clone(),
                })?;

                self.protocol = Protocol::Upgraded(upgraded);
                let Protocol::Upgraded(upgraded) = &mut self.protocol else {
                    return Ok(());
                };

                let mut io = ContextIo::new(world, meta.signal(), &self.tcp_actions);
                upgraded.context.on_connected(&mut io)?;
                if !leftover.is_empty() && !io.close_requested() {
                    upgraded.context.on_received(&mut io, leftover)?;
                }

                if io.close_requested() {
                    meta.set_stop();
                }
            }
        }

        Ok(())
    }
}

impl HttpState {
    fn parse(&mut self, events: &Sender<ClientEvent>) -> Result<Step, Error> {
        let mut data = mem::take(&mut self.buffer).freeze();
        let mut step = Step::Continue;

        while !data.is_empty() && !self.parser.is_error() {
            let mut parsed = Parsed::default();
            let status = self.parser.parse(&mut data, &mut parsed);

            step = self.deliver(parsed, events)?;
            if !matches!(step, Step::Continue) || status != Status::Complete {
                break;
            }
        }

        self.buffer.extend_from_slice(&data);
        Ok(step)
    }

    /// The peer closed, completing a body that's read until close.
    fn finish(&mut self, events: &Sender<ClientEvent>) -> Result<(), Error> {
        let mut parsed = Parsed::default();
        self.parser.finish(&mut parsed);
        self.deliver(parsed, events)?;
        Ok(())
    }

    fn deliver(&mut self, parsed: Parsed, events: &Sender<ClientEvent>) -> Result<Step, Error> {
        for message in parsed.messages {
            let response = match message {
                Ok(response) => response,
                Err(error) => {
                    events.send(ClientEvent::ParseError(error))?;
                    return Ok(Step::Stop);
                }
            };

            event!(Level::DEBUG, status = response.status, "received response");

            let Some(request) = self.pending.pop_front() else {
                event!(Level::WARN, "response without request");
                return Ok(Step::Stop);
            };

            let Some(factory) = request.upgrade.clone() else {
                events.send(ClientEvent::Response(response))?;
                continue;
            };

            if response.status != 101 {
                events.send(ClientEvent::Response(response))?;
                continue;
            }

            return match factory.create(&request, &response) {
                Ok(context) => {
                    let upgraded = Upgraded {
                        protocol: factory.name().to_string(),
                        context,
                        _user: factory.into_user(),
                    };
                    Ok(Step::Switch(upgraded))
                }
                Err(error) => {
                    event!(Level::DEBUG, %error, "upgrade refused");
                    events.send(ClientEvent::UpgradeFailed(error))?;
                    Ok(Step::Stop)
                }
            };
        }

        Ok(Step::Continue)
    }
}

#[derive(Default)]
struct Parsed {
    messages: Vec<Result<ClientResponse, ParseError>>,
}

impl ParserHandler<ClientResponse> for Parsed {
    fn on_message(&mut self, message: ClientResponse) {
        self.messages.push(Ok(message));
    }

    fn on_error(&mut self, error: ParseError) {
        self.messages.push(Err(error));
    }
}
