//! WebSocket server with an `echo` and a `chat` sub-protocol.
//!
//! Connect with a WebSocket client to `ws://127.0.0.1:1234/`, requesting either protocol. Chat
//! messages are broadcast to everyone else in the same group, `/join <group>` switches groups.

use std::rc::Rc;

use anyhow::Error;
use bytes::Bytes;
use tracing::{event, Level};
use wharf::{message::Mailbox, Actor, Meta, World};
use wharf_http::{
    server::{self, HttpEvent, ServerConfig},
    upgrade::{ServerUpgradeRegistry, SERVER_UPGRADE_SUFFIX},
};
use wharf_mio::Registry;
use wharf_websocket::{
    Groups, OpCode, Session, SubProtocol, SubProtocolFactory, SubProtocolRegistry,
    WebSocketServerFactory, SERVER_SUB_PROTOCOL_SUFFIX,
};

fn main() -> Result<(), Error> {
    devutils::init_logging("info");

    let mut world = World::default();
    let registry = Rc::new(Registry::new()?);

    // The groups live as long as the application
    let groups = Rc::new(Groups::new());

    let sub_protocols = SubProtocolRegistry::new(SERVER_SUB_PROTOCOL_SUFFIX);
    sub_protocols.link("echo", Rc::new(EchoFactory));
    sub_protocols.link("chat", Rc::new(ChatFactory));

    let websocket = WebSocketServerFactory::new(Rc::new(sub_protocols)).with_groups(groups);
    let upgrades = ServerUpgradeRegistry::new(SERVER_UPGRADE_SUFFIX);
    upgrades.link("websocket", Rc::new(websocket));

    let config = ServerConfig {
        upgrades: Some(Rc::new(upgrades)),
        ..Default::default()
    };

    let actor = Service::new(&mut world, registry.clone(), config)?;
    world.insert("websocket-chat", actor)?;

    wharf_mio::run_event_loop(&mut world, &registry)?;

    Ok(())
}

struct Service {
    http_events: Mailbox<HttpEvent>,
}

impl Service {
    fn new(world: &mut World, registry: Rc<Registry>, config: ServerConfig) -> Result<Self, Error> {
        let http_events = Mailbox::default();

        let addr = "127.0.0.1:1234".parse()?;
        let info = server::listen(world, registry, addr, config, http_events.sender())?;
        event!(Level::INFO, addr = ?info.local_addr, "listening");

        Ok(Service { http_events })
    }
}

impl Actor for Service {
    fn register(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        self.http_events.set_signal(meta.signal())?;
        Ok(())
    }

    fn process(&mut self, _world: &mut World, _meta: &mut Meta) -> Result<(), Error> {
        while let Some(event) = self.http_events.recv() {
            let HttpEvent::Request(mut event) = event;

            if !event.request.is_upgrade() {
                event.response.send_status(426)?;
                continue;
            }

            // Failures are answered by the upgrade itself
            if let Err(error) = event.response.upgrade(&event.request) {
                event!(Level::INFO, %error, "refused upgrade");
            }
        }

        Ok(())
    }
}

struct EchoFactory;

impl SubProtocolFactory for EchoFactory {
    fn name(&self) -> &str {
        "echo"
    }

    fn create(&self) -> Box<dyn SubProtocol> {
        Box::new(Echo {
            opcode: OpCode::Text,
        })
    }
}

/// Streams every message back as it arrives.
struct Echo {
    opcode: OpCode,
}

impl SubProtocol for Echo {
    fn on_message_start(&mut self, session: &mut Session, opcode: OpCode) -> Result<(), Error> {
        self.opcode = opcode;
        session.send_start(opcode, Bytes::new())
    }

    fn on_message_data(&mut self, session: &mut Session, data: Bytes) -> Result<(), Error> {
        session.send_frame(data)
    }

    fn on_message_end(&mut self, session: &mut Session) -> Result<(), Error> {
        event!(Level::DEBUG, opcode = ?self.opcode, "echoed message");
        session.send_end(Bytes::new())
    }
}

struct ChatFactory;

impl SubProtocolFactory for ChatFactory {
    fn name(&self) -> &str {
        "chat"
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
    fn on_connected(&mut self, session: &mut Session) -> Result<(), Error> {
        session.send_text("welcome, send /join <group> to switch groups")?;
        session.broadcast_text("someone joined", true)
    }

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

        if let Some(group) = message.strip_prefix("/join ") {
            session.subscribe(group.trim());
            return session.send_text(&format!("joined {}", group.trim()));
        }

        session.broadcast_text(&message, true)
    }

    fn on_disconnected(&mut self, session: &mut Session) {
        if let Err(error) = session.broadcast_text("someone left", true) {
            event!(Level::DEBUG, ?error, "failed to announce leaving");
        }
    }
}
