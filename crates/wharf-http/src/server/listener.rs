use std::{net::SocketAddr, rc::Rc};

use anyhow::Error;
use tracing::{event, Level};
use wharf::{
    message::{Mailbox, Sender},
    Actor, Meta, World,
};
use wharf_mio::{net::tcp, Registry};

use crate::server::{connection, ConnectionAction, ConnectionEvent, HttpEvent, ServerConfig};

pub struct ServerInfo {
    pub local_addr: SocketAddr,
}

/// Listen for HTTP connections on `addr`, sending received requests to `http_events`.
///
/// Every accepted stream gets its own connection actor, sharing `config`. Dropping the server
/// closes the listener along with every connection still open.
pub fn listen(
    world: &mut World,
    registry: Rc<Registry>,
    addr: SocketAddr,
    config: ServerConfig,
    http_events: Sender<HttpEvent>,
) -> Result<ServerInfo, Error> {
    let tcp_events = Mailbox::default();
    let tcp_info = tcp::listen(world, registry, addr, tcp_events.sender())?;
    event!(Level::DEBUG, addr = ?tcp_info.local_addr, "http server bound");

    let actor = Service {
        tcp_events,
        tcp_actions: tcp_info.actions,
        http_events,
        config: Rc::new(config),
        connections: Vec::new(),
    };
    world.insert("http-server", actor)?;

    Ok(ServerInfo {
        local_addr: tcp_info.local_addr,
    })
}

struct Service {
    tcp_events: Mailbox<tcp::ListenerEvent>,
    tcp_actions: Sender<tcp::ListenerAction>,
    http_events: Sender<HttpEvent>,
    config: Rc<ServerConfig>,

    connections: Vec<OpenConnection>,
}

struct OpenConnection {
    peer_addr: SocketAddr,
    events: Mailbox<ConnectionEvent>,
    actions: Sender<ConnectionAction>,
}

impl Drop for Service {
    fn drop(&mut self) {
        event!(
            Level::DEBUG,
            open = self.connections.len(),
            "closing http server"
        );

        let _ = self.tcp_actions.send(tcp::ListenerAction::Close);
        for connection in &self.connections {
            let _ = connection.actions.send(ConnectionAction::Close);
        }
    }
}

impl Actor for Service {
    fn register(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        self.tcp_events.set_signal(meta.signal())?;
        Ok(())
    }

    fn process(&mut self, world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        while let Some(event) = self.tcp_events.recv() {
            match event {
                tcp::ListenerEvent::Connected(event) => self.on_accepted(world, meta, event)?,
                tcp::ListenerEvent::Closed => meta.set_stop(),
            }
        }

        // A connection only ever reports closing, drop its entry once it does
        self.connections.retain_mut(|connection| {
            let mut closed = false;
            while let Some(ConnectionEvent::Closed) = connection.events.recv() {
                closed = true;
            }

            if closed {
                event!(Level::DEBUG, peer = ?connection.peer_addr, "connection closed");
            }
            !closed
        });

        Ok(())
    }
}

impl Service {
    fn on_accepted(
        &mut self,
        world: &mut World,
        meta: &mut Meta,
        event: tcp::ConnectedEvent,
    ) -> Result<(), Error> {
        let events = Mailbox::default();
        events.set_signal(meta.signal())?;

        let actions = connection::open(
            world,
            event.events,
            event.actions,
            self.config.clone(),
            events.sender(),
            self.http_events.clone(),
        )?;

        self.connections.push(OpenConnection {
            peer_addr: event.peer_addr,
            events,
            actions,
        });
        event!(
            Level::DEBUG,
            peer = ?event.peer_addr,
            open = self.connections.len(),
            "accepted connection"
        );

        Ok(())
    }
}
