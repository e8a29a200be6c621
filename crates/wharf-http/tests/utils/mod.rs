#![allow(dead_code)]

use std::rc::Rc;

use anyhow::{Context as _, Error};
use bytes::Bytes;
use wharf::{
    message::{Mailbox, Sender},
    World,
};
use wharf_http::{
    client::{self, ClientAction, ClientConfig, ClientEvent},
    server::{self, ConnectionEvent, HttpEvent, RequestEvent, ServerConfig},
};
use wharf_mio::net::tcp::{RecvEvent, StreamAction, StreamEvent};

/// In-memory stand-in for a TCP stream actor.
pub struct MockStream {
    pub events: Sender<StreamEvent>,
    pub actions: Mailbox<StreamAction>,
}

/// Everything the connection asked the stream to do.
#[derive(Default, Debug)]
pub struct Output {
    pub data: String,
    pub shutdown: bool,
    pub close: bool,
}

impl MockStream {
    fn new() -> (Self, Mailbox<StreamEvent>, Sender<StreamAction>) {
        let events = Mailbox::floating();
        let actions = Mailbox::floating();

        let stream = Self {
            events: events.sender(),
            actions: actions.clone(),
        };
        let sender = actions.sender();

        (stream, events, sender)
    }

    pub fn take_output(&self) -> Output {
        let mut output = Output::default();

        while let Some(action) = self.actions.recv() {
            match action {
                StreamAction::Send(action) => {
                    output.data.push_str(&String::from_utf8_lossy(&action.data))
                }
                StreamAction::Shutdown => output.shutdown = true,
                StreamAction::Close => output.close = true,
            }
        }

        output
    }
}

pub struct ServerConnection {
    pub stream: MockStream,
    pub events: Mailbox<ConnectionEvent>,
    pub http_events: Mailbox<HttpEvent>,
}

impl ServerConnection {
    pub fn next_request(&self) -> Option<RequestEvent> {
        match self.http_events.recv()? {
            HttpEvent::Request(event) => Some(event),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.events.recv(), Some(ConnectionEvent::Closed))
    }
}

pub fn given_server_connection(
    world: &mut World,
    config: ServerConfig,
) -> Result<ServerConnection, Error> {
    let (stream, tcp_events, tcp_actions) = MockStream::new();
    let events = Mailbox::floating();
    let http_events = Mailbox::floating();

    server::open(
        world,
        tcp_events,
        tcp_actions,
        Rc::new(config),
        events.sender(),
        http_events.sender(),
    )?;

    let connection = ServerConnection {
        stream,
        events,
        http_events,
    };
    Ok(connection)
}

pub struct ClientConnection {
    pub stream: MockStream,
    pub actions: Sender<ClientAction>,
    pub events: Mailbox<ClientEvent>,
}

impl ClientConnection {
    pub fn next_event(&self) -> Option<ClientEvent> {
        self.events.recv()
    }
}

pub fn given_client_connection(
    world: &mut World,
    config: ClientConfig,
) -> Result<ClientConnection, Error> {
    let (stream, tcp_events, tcp_actions) = MockStream::new();
    let events = Mailbox::floating();

    let actions = client::open(world, tcp_events, tcp_actions, config, events.sender())?;

    let connection = ClientConnection {
        stream,
        actions,
        events,
    };
    Ok(connection)
}

pub fn when_received(world: &mut World, stream: &MockStream, data: &str) -> Result<(), Error> {
    let event = RecvEvent {
        data: Bytes::copy_from_slice(data.as_bytes()),
    };
    stream.events.send(StreamEvent::Recv(event))?;

    world
        .run_until_idle()
        .context("failed to process after receiving")?;

    Ok(())
}

pub fn when_peer_closed(world: &mut World, stream: &MockStream) -> Result<(), Error> {
    stream.events.send(StreamEvent::Closed)?;
    world.run_until_idle()?;
    Ok(())
}

/// Deliver data and the close together, before the connection gets to process either.
pub fn when_received_then_closed(
    world: &mut World,
    stream: &MockStream,
    data: &str,
) -> Result<(), Error> {
    let event = RecvEvent {
        data: Bytes::copy_from_slice(data.as_bytes()),
    };
    stream.events.send(StreamEvent::Recv(event))?;
    stream.events.send(StreamEvent::Closed)?;

    world
        .run_until_idle()
        .context("failed to process after closing")?;

    Ok(())
}
