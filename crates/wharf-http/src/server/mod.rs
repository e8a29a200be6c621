//! HTTP server side, accepting requests and sending back responses.

mod connection;
mod listener;

use std::rc::Rc;

use crate::{upgrade::ServerUpgradeRegistry, HttpConfig, Request, Response};

pub(crate) use self::connection::log_stream_error;
pub use self::{
    connection::{open, ConnectionAction, ConnectionEvent},
    listener::{listen, ServerInfo},
};

pub enum HttpEvent {
    Request(RequestEvent),
}

pub struct RequestEvent {
    pub request: Request,
    /// Response to this specific request.
    ///
    /// HTTP/1.1 can't be multiplexed, the connection holds on to the data of this response until
    /// the responses of all previous requests have been sent.
    pub response: Response,
}

/// Configuration shared by all connections of a server.
#[derive(Default)]
pub struct ServerConfig {
    pub http: HttpConfig,
    /// Protocols connections can be upgraded to.
    pub upgrades: Option<Rc<ServerUpgradeRegistry>>,
}
