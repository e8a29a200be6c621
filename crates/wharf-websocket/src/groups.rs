use std::{cell::RefCell, collections::HashMap};

use tracing::{event, Level};
use uuid::Uuid;

use crate::Peer;

/// Broadcast groups of server side connections.
///
/// Members are grouped by channel, `<sub-protocol>/<group>`. A channel is removed when its last
/// member leaves, the registry itself lives as long as its owner keeps it.
#[derive(Default)]
pub struct Groups {
    channels: RefCell<HashMap<String, Vec<Peer>>>,
}

impl Groups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles to every current member of a channel.
    pub fn members(&self, channel: &str) -> Vec<Peer> {
        self.channels
            .borrow()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn member_count(&self, channel: &str) -> usize {
        self.channels.borrow().get(channel).map_or(0, Vec::len)
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.borrow().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.borrow().is_empty()
    }

    pub(crate) fn join(&self, channel: &str, peer: &Peer) {
        event!(Level::DEBUG, %channel, id = %peer.id(), "joining channel");

        let mut channels = self.channels.borrow_mut();
        let members = channels.entry(channel.to_string()).or_default();

        if !members.iter().any(|member| member.id() == peer.id()) {
            members.push(peer.clone());
        }
    }

    pub(crate) fn leave(&self, channel: &str, id: Uuid) {
        let mut channels = self.channels.borrow_mut();
        let Some(members) = channels.get_mut(channel) else {
            return;
        };

        members.retain(|member| member.id() != id);
        event!(Level::DEBUG, %channel, %id, "left channel");

        if members.is_empty() {
            channels.remove(channel);
        }
    }
}
