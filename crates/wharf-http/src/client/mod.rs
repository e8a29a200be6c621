//! HTTP client side, sending requests and receiving responses.

mod connection;

use std::rc::Rc;

use crate::{
    upgrade::{ClientUpgradeRegistry, UpgradeError},
    ClientRequest, ClientResponse, HttpConfig, ParseError,
};

pub use self::connection::{connect, open};

pub enum ClientAction {
    /// Send a request, responses are delivered in the order requests were sent.
    Send(ClientRequest),
    Close,
}

pub enum ClientEvent {
    Response(ClientResponse),
    /// The server accepted switching protocols, the connection is now handled by the protocol.
    Upgraded { protocol: String },
    /// The server answered an upgrade request, but the protocol refused the answer.
    UpgradeFailed(UpgradeError),
    /// The server sent a malformed response, the connection is closed.
    ParseError(ParseError),
    Closed,
}

#[derive(Default)]
pub struct ClientConfig {
    pub http: HttpConfig,
    /// Registry upgrade requests were resolved from, unused factories are collected from it when
    /// a connection closes.
    pub upgrades: Option<Rc<ClientUpgradeRegistry>>,
}
