use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr},
    rc::Rc,
};

use anyhow::Error;
use bytes::{Buf, Bytes, BytesMut};
use mio::{Interest, Token};
use tracing::{event, instrument, Level};
use wharf::{
    message::{Mailbox, Sender},
    Actor, Meta, World,
};

use crate::{net::tcp::ConnectedEvent, Ready, Registry};

pub enum StreamAction {
    /// Send data to the peer.
    Send(SendAction),
    /// Flush pending data, then shut down the write half of the stream.
    Shutdown,
    /// Close and stop the stream immediately.
    Close,
}

pub struct SendAction {
    pub data: Bytes,
}

pub enum StreamEvent {
    /// Data received from the peer.
    Recv(RecvEvent),
    /// The stream failed, followed by `Closed`.
    Error(ErrorKind),
    /// The stream has been closed, no further events will be sent.
    Closed,
}

pub struct RecvEvent {
    pub data: Bytes,
}

/// Connect to a remote TCP listener.
///
/// Data sent before the connection is established is buffered.
#[instrument("tcp::connect", skip_all)]
pub fn connect(
    world: &mut World,
    registry: Rc<Registry>,
    addr: SocketAddr,
) -> Result<ConnectedEvent, Error> {
    event!(Level::DEBUG, ?addr, "connecting");

    let stream = mio::net::TcpStream::connect(addr)?;
    let (events, actions) = open(world, registry, stream, true)?;

    let event = ConnectedEvent {
        peer_addr: addr,
        events,
        actions,
    };
    Ok(event)
}

pub(crate) fn open(
    world: &mut World,
    registry: Rc<Registry>,
    stream: mio::net::TcpStream,
    connecting: bool,
) -> Result<(Mailbox<StreamEvent>, Sender<StreamAction>), Error> {
    let events = Mailbox::floating();
    let actor = Service::new(registry, stream, events.sender(), connecting)?;
    let actions = actor.actions.sender();
    world.insert("tcp-stream", actor)?;

    Ok((events, actions))
}

struct Service {
    registry: Rc<Registry>,
    actions: Mailbox<StreamAction>,
    ready: Mailbox<Ready>,
    events: Sender<StreamEvent>,

    stream: mio::net::TcpStream,
    token: Token,
    interest: Interest,
    connecting: bool,
    pending: BytesMut,
    shutdown_requested: bool,
    write_closed: bool,
    closed: bool,
}

impl Service {
    fn new(
        registry: Rc<Registry>,
        mut stream: mio::net::TcpStream,
        events: Sender<StreamEvent>,
        connecting: bool,
    ) -> Result<Self, Error> {
        event!(Level::DEBUG, "opening stream");

        let ready = Mailbox::floating();
        let interest = if connecting {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let token = registry.register(&mut stream, interest, ready.sender())?;

        let value = Service {
            registry,
            actions: Mailbox::default(),
            ready,
            events,

            stream,
            token,
            interest,
            connecting,
            pending: BytesMut::new(),
            shutdown_requested: false,
            write_closed: false,
            closed: false,
        };
        Ok(value)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        event!(Level::DEBUG, "closing stream");

        let _ = self.registry.deregister(&mut self.stream, self.token);
        if !self.closed {
            let _ = self.events.send(StreamEvent::Closed);
        }
    }
}

impl Actor for Service {
    fn register(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        self.actions.set_signal(meta.signal())?;
        self.ready.set_signal(meta.signal())?;
        Ok(())
    }

    fn process(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        let mut readable = false;
        let mut writable = false;
        while let Some(ready) = self.ready.recv() {
            readable |= ready.readable;
            writable |= ready.writable;
        }

        if writable && self.connecting {
            self.on_connect_ready(meta)?;
        }

        if readable && !self.closed {
            self.on_ready_readable(meta)?;
        }

        while let Some(action) = self.actions.recv() {
            match action {
                StreamAction::Send(action) => self.pending.extend_from_slice(&action.data),
                StreamAction::Shutdown => self.shutdown_requested = true,
                StreamAction::Close => {
                    event!(Level::DEBUG, "close requested");
                    meta.set_stop();
                    return Ok(());
                }
            }
        }

        if !self.connecting && !self.closed {
            self.flush(meta)?;
        }

        Ok(())
    }
}

impl Service {
    fn on_connect_ready(&mut self, meta: &mut Meta) -> Result<(), Error> {
        if let Some(error) = self.stream.take_error()? {
            self.fail(meta, error.kind());
            return Ok(());
        }

        // Not yet connected means this was a spurious wake
        match self.stream.peer_addr() {
            Ok(_) => {
                event!(Level::DEBUG, "stream connected");
                self.connecting = false;
            }
            Err(error) if error.kind() == ErrorKind::NotConnected => {}
            Err(error) => self.fail(meta, error.kind()),
        }

        Ok(())
    }

    fn on_ready_readable(&mut self, meta: &mut Meta) -> Result<(), Error> {
        let mut buffer = BytesMut::zeroed(4096);
        let mut bytes_read = 0;
        let mut peer_closed = false;

        loop {
            let result = self.stream.read(&mut buffer[bytes_read..]);

            match result {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(len) => {
                    bytes_read += len;
                    if bytes_read == buffer.len() {
                        buffer.resize(buffer.len() * 2, 0);
                    }
                }
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock | ErrorKind::NotConnected => break,
                    ErrorKind::Interrupted => continue,
                    kind => {
                        self.fail(meta, kind);
                        return Ok(());
                    }
                },
            }
        }

        if bytes_read != 0 {
            event!(Level::TRACE, count = bytes_read, "received data");
            buffer.truncate(bytes_read);
            let event = RecvEvent {
                data: buffer.freeze(),
            };
            self.events.send(StreamEvent::Recv(event))?;
        }

        if peer_closed {
            event!(Level::DEBUG, "peer closed stream");
            self.closed = true;
            self.events.send(StreamEvent::Closed)?;
            meta.set_stop();
        }

        Ok(())
    }

    fn flush(&mut self, meta: &mut Meta) -> Result<(), Error> {
        while !self.pending.is_empty() && !self.write_closed {
            match self.stream.write(&self.pending) {
                Ok(0) => {
                    self.fail(meta, ErrorKind::WriteZero);
                    return Ok(());
                }
                Ok(len) => {
                    event!(Level::TRACE, count = len, "sent data");
                    self.pending.advance(len);
                }
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    kind => {
                        self.fail(meta, kind);
                        return Ok(());
                    }
                },
            }
        }

        if self.pending.is_empty() && self.shutdown_requested && !self.write_closed {
            event!(Level::DEBUG, "shutting down write half");
            self.write_closed = true;
            if let Err(error) = self.stream.shutdown(Shutdown::Write) {
                if error.kind() != ErrorKind::NotConnected {
                    self.fail(meta, error.kind());
                    return Ok(());
                }
            }
        }

        // Only wait for writable while there's something left to write
        let interest = if self.pending.is_empty() || self.write_closed {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if interest != self.interest {
            self.registry
                .reregister(&mut self.stream, self.token, interest)?;
            self.interest = interest;
        }

        Ok(())
    }

    fn fail(&mut self, meta: &mut Meta, kind: ErrorKind) {
        event!(Level::DEBUG, ?kind, "stream failed");

        let _ = self.events.send(StreamEvent::Error(kind));
        let _ = self.events.send(StreamEvent::Closed);
        self.closed = true;
        meta.set_stop();
    }
}
