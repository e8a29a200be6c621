use std::{net::SocketAddr, rc::Rc};

use anyhow::Error;
use mio::{Interest, Token};
use tracing::{event, instrument, Level};
use wharf::{
    message::{Mailbox, Sender},
    Actor, Meta, World,
};

use crate::{
    net::{check_io, tcp},
    Ready, Registry,
};

pub enum ListenerAction {
    /// Close the listener.
    Close,
}

pub enum ListenerEvent {
    Connected(ConnectedEvent),
    Closed,
}

/// A newly accepted or connected stream.
pub struct ConnectedEvent {
    pub peer_addr: SocketAddr,
    /// Floating mailbox of stream events, bind it to the actor that takes over the stream.
    pub events: Mailbox<tcp::StreamEvent>,
    pub actions: Sender<tcp::StreamAction>,
}

pub struct ListenerInfo {
    pub local_addr: SocketAddr,
    pub actions: Sender<ListenerAction>,
}

/// Open a TCP stream listener on the given address.
///
/// TCP, unlike UDP, works with ongoing connections.
/// Before a connection is established, you first need to 'listen' for those on a port.
#[instrument("tcp::listen", skip_all)]
pub fn listen(
    world: &mut World,
    registry: Rc<Registry>,
    addr: SocketAddr,
    events: Sender<ListenerEvent>,
) -> Result<ListenerInfo, Error> {
    let actor = Service::new(registry, addr, events)?;

    let info = ListenerInfo {
        local_addr: actor.listener.local_addr()?,
        actions: actor.actions.sender(),
    };
    world.insert("tcp-listener", actor)?;

    Ok(info)
}

struct Service {
    registry: Rc<Registry>,
    actions: Mailbox<ListenerAction>,
    ready: Mailbox<Ready>,
    events: Sender<ListenerEvent>,

    listener: mio::net::TcpListener,
    token: Token,
}

impl Service {
    fn new(
        registry: Rc<Registry>,
        addr: SocketAddr,
        events: Sender<ListenerEvent>,
    ) -> Result<Self, Error> {
        event!(Level::DEBUG, ?addr, "binding");

        let ready = Mailbox::floating();
        let mut listener = mio::net::TcpListener::bind(addr)?;
        let token = registry.register(&mut listener, Interest::READABLE, ready.sender())?;

        let value = Self {
            registry,
            actions: Mailbox::default(),
            ready,
            events,

            listener,
            token,
        };
        Ok(value)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        event!(Level::DEBUG, "closing listener");

        let _ = self.registry.deregister(&mut self.listener, self.token);
        let _ = self.events.send(ListenerEvent::Closed);
    }
}

impl Actor for Service {
    fn register(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        self.actions.set_signal(meta.signal())?;
        self.ready.set_signal(meta.signal())?;
        Ok(())
    }

    fn process(&mut self, world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        let mut readable = false;
        while let Some(ready) = self.ready.recv() {
            readable |= ready.readable;
        }

        if readable {
            self.on_listener_ready(world)?;
        }

        while let Some(action) = self.actions.recv() {
            match action {
                ListenerAction::Close => meta.set_stop(),
            }
        }

        Ok(())
    }
}

impl Service {
    fn on_listener_ready(&mut self, world: &mut World) -> Result<(), Error> {
        // Accept any pending streams
        while let Some((stream, peer_addr)) = check_io(self.listener.accept())? {
            event!(Level::DEBUG, ?peer_addr, "stream accepted");

            let (events, actions) =
                tcp::stream::open(world, self.registry.clone(), stream, false)?;

            let event = ConnectedEvent {
                peer_addr,
                events,
                actions,
            };
            self.events.send(ListenerEvent::Connected(event))?;
        }

        Ok(())
    }
}
