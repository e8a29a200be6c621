use std::rc::Rc;

use anyhow::{Context as _, Error};
use bytes::Bytes;
use tracing::{event, Level};
use uuid::Uuid;
use wharf::message::Sender;

use crate::{Groups, OpCode};

/// Queued work for the connection that owns the mailbox.
pub(crate) enum Outgoing {
    Message { opcode: OpCode, data: Bytes },
    Start { opcode: OpCode, data: Bytes },
    Frame(Bytes),
    End(Bytes),
    Ping(Bytes),
    Close { code: u16, reason: String },
}

/// Handle for sending messages to a WebSocket connection.
///
/// Messages are queued and sent when the connection is next processed, the handle can be kept
/// by other connections.
#[derive(Clone)]
pub struct Peer {
    id: Uuid,
    outgoing: Sender<Outgoing>,
}

impl Peer {
    pub(crate) fn new(outgoing: Sender<Outgoing>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outgoing,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns true if the connection is gone.
    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }

    pub fn send_text(&self, text: &str) -> Result<(), Error> {
        self.send(Outgoing::Message {
            opcode: OpCode::Text,
            data: Bytes::copy_from_slice(text.as_bytes()),
        })
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send(Outgoing::Message {
            opcode: OpCode::Binary,
            data: data.into(),
        })
    }

    /// Start a message that's continued with `send_frame` and completed with `send_end`.
    pub fn send_start(&self, opcode: OpCode, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send(Outgoing::Start {
            opcode,
            data: data.into(),
        })
    }

    pub fn send_frame(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send(Outgoing::Frame(data.into()))
    }

    pub fn send_end(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send(Outgoing::End(data.into()))
    }

    fn send(&self, outgoing: Outgoing) -> Result<(), Error> {
        self.outgoing
            .send(outgoing)
            .context("websocket connection gone")?;
        Ok(())
    }
}

/// The sending side of a connection, as seen by its sub-protocol.
pub struct Session {
    protocol: String,
    peer: Peer,
    groups: Option<Rc<Groups>>,
    channel: Option<String>,
}

impl Session {
    pub(crate) fn new(protocol: &str, peer: Peer, groups: Option<Rc<Groups>>) -> Self {
        let mut session = Self {
            protocol: protocol.to_string(),
            peer,
            groups,
            channel: None,
        };

        session.subscribe("");
        session
    }

    /// Name of the negotiated sub-protocol.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn id(&self) -> Uuid {
        self.peer.id()
    }

    /// Handle of this connection, for keeping elsewhere.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn send_text(&self, text: &str) -> Result<(), Error> {
        self.peer.send_text(text)
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.peer.send_binary(data)
    }

    pub fn send_start(&self, opcode: OpCode, data: impl Into<Bytes>) -> Result<(), Error> {
        self.peer.send_start(opcode, data)
    }

    pub fn send_frame(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.peer.send_frame(data)
    }

    pub fn send_end(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.peer.send_end(data)
    }

    pub fn send_ping(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.peer.send(Outgoing::Ping(data.into()))
    }

    /// Start the closing handshake.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), Error> {
        self.peer.send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        })
    }

    /// Current broadcast channel, if the connection has groups.
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Move to another broadcast group, an empty name being the sub-protocol's default group.
    ///
    /// Does nothing if already in that group.
    pub fn subscribe(&mut self, group: &str) {
        let Some(groups) = &self.groups else {
            return;
        };

        let group = if group.is_empty() {
            self.protocol.as_str()
        } else {
            group
        };
        let channel = format!("{}/{}", self.protocol, group);

        if self.channel.as_deref() == Some(channel.as_str()) {
            return;
        }

        groups.join(&channel, &self.peer);
        if let Some(previous) = self.channel.replace(channel) {
            groups.leave(&previous, self.peer.id());
        }
    }

    pub fn unsubscribe(&mut self) {
        let (Some(groups), Some(channel)) = (&self.groups, self.channel.take()) else {
            return;
        };

        groups.leave(&channel, self.peer.id());
    }

    pub fn broadcast_text(&self, text: &str, exclude_self: bool) -> Result<(), Error> {
        self.for_each_client(exclude_self, |peer| peer.send_text(text))
    }

    pub fn broadcast_binary(&self, data: impl Into<Bytes>, exclude_self: bool) -> Result<(), Error> {
        let data = data.into();
        self.for_each_client(exclude_self, |peer| peer.send_binary(data.clone()))
    }

    pub fn broadcast_start(
        &self,
        opcode: OpCode,
        data: impl Into<Bytes>,
        exclude_self: bool,
    ) -> Result<(), Error> {
        let data = data.into();
        self.for_each_client(exclude_self, |peer| peer.send_start(opcode, data.clone()))
    }

    pub fn broadcast_frame(&self, data: impl Into<Bytes>, exclude_self: bool) -> Result<(), Error> {
        let data = data.into();
        self.for_each_client(exclude_self, |peer| peer.send_frame(data.clone()))
    }

    pub fn broadcast_end(&self, data: impl Into<Bytes>, exclude_self: bool) -> Result<(), Error> {
        let data = data.into();
        self.for_each_client(exclude_self, |peer| peer.send_end(data.clone()))
    }

    /// Call `f` for every member of the current channel.
    ///
    /// Members that went away in the meantime are skipped.
    pub fn for_each_client<F>(&self, exclude_self: bool, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&Peer) -> Result<(), Error>,
    {
        let (Some(groups), Some(channel)) = (&self.groups, &self.channel) else {
            return Ok(());
        };

        for peer in groups.members(channel) {
            if exclude_self && peer.id() == self.peer.id() {
                continue;
            }

            if peer.is_closed() {
                event!(Level::TRACE, id = %peer.id(), "skipping closed peer");
                continue;
            }

            f(&peer)?;
        }

        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
