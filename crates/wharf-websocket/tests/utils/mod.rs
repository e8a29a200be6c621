#![allow(dead_code)]

use std::{cell::RefCell, rc::Rc};

use anyhow::{Context as _, Error};
use bytes::{Bytes, BytesMut};
use wharf::{
    message::{Mailbox, Sender},
    World,
};
use wharf_http::{
    client::{self, ClientAction, ClientConfig, ClientEvent},
    server::{self, ConnectionEvent, HttpEvent, RequestEvent, ServerConfig},
    upgrade::{
        ClientUpgradeRegistry, ServerUpgradeRegistry, CLIENT_UPGRADE_SUFFIX, SERVER_UPGRADE_SUFFIX,
    },
    ClientRequest,
};
use wharf_mio::net::tcp::{RecvEvent, StreamAction, StreamEvent};
use wharf_websocket::{
    frame::encode_frame, Groups, Liveness, OpCode, ProtocolError, Receiver, ReceiverHandler,
    Session, SubProtocol, SubProtocolFactory, SubProtocolRegistry, WebSocketClientFactory,
    WebSocketServerFactory, CLIENT_SUB_PROTOCOL_SUFFIX, SERVER_SUB_PROTOCOL_SUFFIX,
};

pub const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Shared record of what sub-protocol instances saw.
pub type Log = Rc<RefCell<Vec<String>>>;

pub struct Connection {
    pub tcp_events: Sender<StreamEvent>,
    pub tcp_actions: Mailbox<StreamAction>,
    pub events: Mailbox<ConnectionEvent>,
    pub http_events: Mailbox<HttpEvent>,
}

#[derive(Default, Debug)]
pub struct Output {
    pub data: Vec<u8>,
    pub shutdown: bool,
    pub close: bool,
}

impl Output {
    /// Split off the HTTP response head, returning it as text.
    pub fn take_head(&mut self) -> String {
        let end = self
            .data
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map_or(self.data.len(), |position| position + 4);

        let head: Vec<u8> = self.data.drain(..end).collect();
        String::from_utf8_lossy(&head).into_owned()
    }

    /// Decode the frames sent by the server.
    pub fn frames(&self) -> Vec<(OpCode, Vec<u8>)> {
        self.decode(false)
    }

    /// Decode the masked frames sent by a client.
    pub fn client_frames(&self) -> Vec<(OpCode, Vec<u8>)> {
        self.decode(true)
    }

    fn decode(&self, masked: bool) -> Vec<(OpCode, Vec<u8>)> {
        let mut receiver = Receiver::new(masked, usize::MAX);
        let mut frames = Frames::default();
        receiver.receive(&mut Bytes::copy_from_slice(&self.data), &mut frames);

        assert!(frames.errors.is_empty(), "{:?}", frames.errors);
        frames.frames
    }
}

#[derive(Default)]
struct Frames {
    frames: Vec<(OpCode, Vec<u8>)>,
    current: Option<(OpCode, Vec<u8>)>,
    errors: Vec<ProtocolError>,
}

impl ReceiverHandler for Frames {
    fn on_message_start(&mut self, opcode: OpCode) {
        self.current = Some((opcode, Vec::new()));
    }

    fn on_message_data(&mut self, data: Bytes) {
        if let Some((_, payload)) = &mut self.current {
            payload.extend_from_slice(&data);
        }
    }

    fn on_message_end(&mut self) {
        self.frames.extend(self.current.take());
    }

    fn on_control(&mut self, opcode: OpCode, payload: Bytes) {
        self.frames.push((opcode, payload.to_vec()));
    }

    fn on_error(&mut self, error: ProtocolError) {
        self.errors.push(error);
    }
}

fn drain_output(tcp_actions: &Mailbox<StreamAction>) -> Output {
    let mut output = Output::default();

    while let Some(action) = tcp_actions.recv() {
        match action {
            StreamAction::Send(action) => output.data.extend_from_slice(&action.data),
            StreamAction::Shutdown => output.shutdown = true,
            StreamAction::Close => output.close = true,
        }
    }

    output
}

impl Connection {
    pub fn take_output(&self) -> Output {
        drain_output(&self.tcp_actions)
    }

    pub fn next_request(&self) -> Option<RequestEvent> {
        match self.http_events.recv()? {
            HttpEvent::Request(event) => Some(event),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.events.recv(), Some(ConnectionEvent::Closed))
    }
}

/// Server upgrade registry with `websocket` linked, offering the given sub-protocols.
pub fn given_websocket_server(
    factories: Vec<Rc<dyn SubProtocolFactory>>,
    groups: Option<Rc<Groups>>,
) -> ServerConfig {
    let sub_protocols = SubProtocolRegistry::new(SERVER_SUB_PROTOCOL_SUFFIX);
    for factory in factories {
        sub_protocols.link(&factory.name().to_string(), factory);
    }

    let mut websocket = WebSocketServerFactory::new(Rc::new(sub_protocols));
    if let Some(groups) = groups {
        websocket = websocket.with_groups(groups);
    }

    let upgrades = ServerUpgradeRegistry::new(SERVER_UPGRADE_SUFFIX);
    upgrades.link("websocket", Rc::new(websocket));

    ServerConfig {
        upgrades: Some(Rc::new(upgrades)),
        ..Default::default()
    }
}

pub fn given_connection(world: &mut World, config: Rc<ServerConfig>) -> Result<Connection, Error> {
    let tcp_events = Mailbox::floating();
    let tcp_actions = Mailbox::floating();
    let events = Mailbox::floating();
    let http_events = Mailbox::floating();

    server::open(
        world,
        tcp_events.clone(),
        tcp_actions.sender(),
        config,
        events.sender(),
        http_events.sender(),
    )?;

    let connection = Connection {
        tcp_events: tcp_events.sender(),
        tcp_actions,
        events,
        http_events,
    };
    Ok(connection)
}

/// Client side of a connection, upgrading through the `websocket` client factory.
pub struct ClientConnection {
    pub tcp_events: Sender<StreamEvent>,
    pub tcp_actions: Mailbox<StreamAction>,
    pub actions: Sender<ClientAction>,
    pub events: Mailbox<ClientEvent>,
    pub upgrades: Rc<ClientUpgradeRegistry>,
}

impl ClientConnection {
    pub fn take_output(&self) -> Output {
        drain_output(&self.tcp_actions)
    }

    pub fn next_event(&self) -> Option<ClientEvent> {
        self.events.recv()
    }

    /// Send an upgrade request asking for `protocol`, returning the key it carries.
    pub fn send_upgrade(&self, world: &mut World, protocol: &str) -> Result<String, Error> {
        let mut request = ClientRequest::get("/ws");
        request.set("Sec-WebSocket-Protocol", protocol);
        request.upgrade(&self.upgrades, "websocket")?;
        let key = request.headers.get("sec-websocket-key").to_string();

        self.actions.send(ClientAction::Send(request))?;
        world.run_until_idle()?;

        Ok(key)
    }
}

pub fn given_websocket_client(
    world: &mut World,
    factories: Vec<Rc<dyn SubProtocolFactory>>,
) -> Result<ClientConnection, Error> {
    let sub_protocols = SubProtocolRegistry::new(CLIENT_SUB_PROTOCOL_SUFFIX);
    for factory in factories {
        sub_protocols.link(&factory.name().to_string(), factory);
    }

    let upgrades = Rc::new(ClientUpgradeRegistry::new(CLIENT_UPGRADE_SUFFIX));
    upgrades.link(
        "websocket",
        Rc::new(WebSocketClientFactory::new(Rc::new(sub_protocols))),
    );

    let tcp_events = Mailbox::floating();
    let tcp_actions = Mailbox::floating();
    let events = Mailbox::floating();

    let config = ClientConfig {
        upgrades: Some(upgrades.clone()),
        ..Default::default()
    };
    let actions = client::open(
        world,
        tcp_events.clone(),
        tcp_actions.sender(),
        config,
        events.sender(),
    )?;

    let connection = ClientConnection {
        tcp_events: tcp_events.sender(),
        tcp_actions,
        actions,
        events,
        upgrades,
    };
    Ok(connection)
}

pub fn when_client_received(
    world: &mut World,
    connection: &ClientConnection,
    data: &[u8],
) -> Result<(), Error> {
    let event = RecvEvent {
        data: Bytes::copy_from_slice(data),
    };
    connection.tcp_events.send(StreamEvent::Recv(event))?;

    world.run_until_idle()?;
    Ok(())
}

/// A frame as a server sends it.
pub fn server_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::new();
    encode_frame(fin, opcode, None, payload, &mut out);
    out.to_vec()
}

pub fn switching_protocols(accept: &str, protocol: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\nSec-WebSocket-Protocol: {}\r\n\r\n",
        accept, protocol
    )
}

/// Open a connection and upgrade it to `protocol`, dropping the handshake output.
pub fn given_upgraded(
    world: &mut World,
    config: Rc<ServerConfig>,
    protocol: &str,
) -> Result<Connection, Error> {
    let connection = given_connection(world, config)?;

    when_received(world, &connection, upgrade_request(protocol).as_bytes())?;
    let mut event = connection.next_request().context("no upgrade request")?;
    event.response.upgrade(&event.request)?;
    world.run_until_idle()?;

    let head = connection.take_output().take_head();
    assert!(head.starts_with("HTTP/1.1 101 "), "{}", head);

    Ok(connection)
}

pub fn upgrade_request(protocol: &str) -> String {
    format!(
        "GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Protocol: {}\r\n\r\n",
        KEY, protocol
    )
}

pub fn when_received(world: &mut World, connection: &Connection, data: &[u8]) -> Result<(), Error> {
    let event = RecvEvent {
        data: Bytes::copy_from_slice(data),
    };
    connection.tcp_events.send(StreamEvent::Recv(event))?;

    world.run_until_idle()?;
    Ok(())
}

pub fn when_peer_closed(world: &mut World, connection: &Connection) -> Result<(), Error> {
    connection.tcp_events.send(StreamEvent::Closed)?;
    world.run_until_idle()?;
    Ok(())
}

/// A frame as a client sends it.
pub fn client_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::new();
    encode_frame(fin, opcode, Some([0x12, 0x34, 0x56, 0x78]), payload, &mut out);
    out.to_vec()
}

pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Echoes every message, logging what happens.
pub struct EchoFactory {
    pub log: Log,
    pub liveness: Liveness,
}

impl SubProtocolFactory for EchoFactory {
    fn name(&self) -> &str {
        "echo"
    }

    fn liveness(&self) -> Liveness {
        self.liveness
    }

    fn create(&self) -> Box<dyn SubProtocol> {
        Box::new(Echo {
            log: self.log.clone(),
            opcode: OpCode::Text,
            message: Vec::new(),
        })
    }
}

struct Echo {
    log: Log,
    opcode: OpCode,
    message: Vec<u8>,
}

impl SubProtocol for Echo {
    fn on_connected(&mut self, session: &mut Session) -> Result<(), Error> {
        self.log
            .borrow_mut()
            .push(format!("connected {}", session.protocol()));
        Ok(())
    }

    fn on_message_start(&mut self, _session: &mut Session, opcode: OpCode) -> Result<(), Error> {
        self.opcode = opcode;
        self.message.clear();
        Ok(())
    }

    fn on_message_data(&mut self, _session: &mut Session, data: Bytes) -> Result<(), Error> {
        self.message.extend_from_slice(&data);
        Ok(())
    }

    fn on_message_end(&mut self, session: &mut Session) -> Result<(), Error> {
        let message = std::mem::take(&mut self.message);
        self.log
            .borrow_mut()
            .push(format!("message {}", String::from_utf8_lossy(&message)));

        match self.opcode {
            OpCode::Text => session.send_text(&String::from_utf8_lossy(&message)),
            _ => session.send_binary(message),
        }
    }

    fn on_message_error(&mut self, _session: &mut Session, error: &ProtocolError) {
        self.log.borrow_mut().push(format!("error {}", error.close_code()));
    }

    fn on_pong_received(&mut self, _session: &mut Session) {
        self.log.borrow_mut().push("pong".to_string());
    }

    fn on_disconnected(&mut self, _session: &mut Session) {
        self.log.borrow_mut().push("disconnected".to_string());
    }
}

/// Broadcasts every message to the rest of its group, `/join <group>` switches groups.
pub struct ChatFactory;

impl SubProtocolFactory for ChatFactory {
    fn name(&self) -> &str {
        "chat"
    }

    fn liveness(&self) -> Liveness {
        Liveness::disabled()
    }

    fn create(&self) -> Box<dyn SubProtocol> {
        Box::new(Chat {
            message: Vec::new(),
        })
    }
}

struct Chat {
    message: Vec<u8>,
}

impl SubProtocol for Chat {
    fn on_message_start(&mut self, _session: &mut Session, _opcode: OpCode) -> Result<(), Error> {
        self.message.clear();
        Ok(())
    }

    fn on_message_data(&mut self, _session: &mut Session, data: Bytes) -> Result<(), Error> {
        self.message.extend_from_slice(&data);
        Ok(())
    }

    fn on_message_end(&mut self, session: &mut Session) -> Result<(), Error> {
        let message = String::from_utf8_lossy(&self.message).into_owned();

        match message.strip_prefix("/join ") {
            Some(group) => {
                session.subscribe(group);
                Ok(())
            }
            None => session.broadcast_text(&message, true),
        }
    }
}
