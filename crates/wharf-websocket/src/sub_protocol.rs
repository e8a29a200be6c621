use anyhow::Error;
use bytes::Bytes;
use wharf_http::upgrade::FactoryRegistry;

use crate::{Liveness, OpCode, ProtocolError, Session};

/// Symbol suffix of server side sub-protocol factories.
pub const SERVER_SUB_PROTOCOL_SUFFIX: &str = "ServerSubProtocolFactory";

/// Symbol suffix of client side sub-protocol factories.
pub const CLIENT_SUB_PROTOCOL_SUFFIX: &str = "ClientSubProtocolFactory";

pub type SubProtocolRegistry = FactoryRegistry<dyn SubProtocolFactory>;

/// Application handler of the messages of a single WebSocket connection.
///
/// Messages are delivered in pieces as frames arrive, a message can be larger than any buffer
/// the connection holds.
pub trait SubProtocol {
    #[allow(unused_variables)]
    fn on_connected(&mut self, session: &mut Session) -> Result<(), Error> {
        Ok(())
    }

    /// A text or binary message starts.
    fn on_message_start(&mut self, session: &mut Session, opcode: OpCode) -> Result<(), Error>;

    fn on_message_data(&mut self, session: &mut Session, data: Bytes) -> Result<(), Error>;

    fn on_message_end(&mut self, session: &mut Session) -> Result<(), Error>;

    /// The peer violated the protocol, the connection is being closed.
    #[allow(unused_variables)]
    fn on_message_error(&mut self, session: &mut Session, error: &ProtocolError) {}

    #[allow(unused_variables)]
    fn on_pong_received(&mut self, session: &mut Session) {}

    #[allow(unused_variables)]
    fn on_disconnected(&mut self, session: &mut Session) {}
}

/// Creates sub-protocol instances, negotiated by name through `Sec-WebSocket-Protocol`.
pub trait SubProtocolFactory {
    fn name(&self) -> &str;

    fn liveness(&self) -> Liveness {
        Liveness::default()
    }

    fn create(&self) -> Box<dyn SubProtocol>;
}
