//! WebSocket connections on top of upgraded wharf-http connections.
//!
//! The `websocket` upgrade factories switch an HTTP connection to a `WebSocketContext`, which
//! frames messages and hands them to a named `SubProtocol`. Server side sub-protocols can join
//! broadcast `Groups` to fan messages out to other connections.

mod config;
mod context;
mod factory;
pub mod frame;
mod groups;
mod receiver;
mod session;
mod sub_protocol;
mod transmitter;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};

pub use self::{
    config::{Liveness, WebSocketConfig},
    context::WebSocketContext,
    factory::{WebSocketClientFactory, WebSocketServerFactory},
    frame::{close_code, OpCode, ProtocolError},
    groups::Groups,
    receiver::{Receiver, ReceiverHandler},
    session::{Peer, Session},
    sub_protocol::{
        SubProtocol, SubProtocolFactory, SubProtocolRegistry, CLIENT_SUB_PROTOCOL_SUFFIX,
        SERVER_SUB_PROTOCOL_SUFFIX,
    },
    transmitter::Transmitter,
};

/// Name of the protocol in `Upgrade` headers.
pub const PROTOCOL_NAME: &str = "websocket";

/// Only supported `Sec-WebSocket-Version`.
pub const VERSION: &str = "13";

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` answer to a `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Generate a random `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let mut key = [0u8; 16];
    fastrand::fill(&mut key);
    STANDARD.encode(key)
}
