use std::rc::Rc;

use tracing::{event, Level};
use wharf_http::{
    upgrade::{ClientUpgradeFactory, ServerUpgradeFactory, UpgradeError, UpgradedContext},
    ClientRequest, ClientResponse, Request, Response,
};

use crate::{
    accept_key, context::Role, generate_key, Groups, SubProtocolRegistry, WebSocketConfig,
    WebSocketContext, PROTOCOL_NAME, VERSION,
};

/// Accepts `Upgrade: websocket` requests.
///
/// The first sub-protocol of `Sec-WebSocket-Protocol` the registry can resolve is used.
pub struct WebSocketServerFactory {
    sub_protocols: Rc<SubProtocolRegistry>,
    groups: Option<Rc<Groups>>,
    config: WebSocketConfig,
}

impl WebSocketServerFactory {
    pub fn new(sub_protocols: Rc<SubProtocolRegistry>) -> Self {
        Self {
            sub_protocols,
            groups: None,
            config: WebSocketConfig::default(),
        }
    }

    /// Let sub-protocols broadcast through `groups`.
    pub fn with_groups(mut self, groups: Rc<Groups>) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }
}

impl ServerUpgradeFactory for WebSocketServerFactory {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn create(
        &self,
        request: &Request,
        response: &mut Response,
    ) -> Result<Box<dyn UpgradedContext>, UpgradeError> {
        let version = request.header("sec-websocket-version");
        if version != VERSION {
            response.set("Sec-WebSocket-Version", VERSION, true);
            return Err(UpgradeError::UnsupportedVersion(version.to_string()));
        }

        let key = request.header("sec-websocket-key");
        if key.is_empty() {
            return Err(UpgradeError::Rejected("missing Sec-WebSocket-Key".to_string()));
        }

        let requested = request.header("sec-websocket-protocol");
        let factory = requested
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .find_map(|name| self.sub_protocols.resolve(name))
            .ok_or_else(|| {
                UpgradeError::Rejected(format!("no supported sub-protocol in \"{}\"", requested))
            })?;

        event!(Level::DEBUG, sub_protocol = factory.name(), "accepting websocket");

        response
            .status(101)
            .set("Upgrade", PROTOCOL_NAME, true)
            .set("Connection", "Upgrade", true)
            .set("Sec-WebSocket-Protocol", factory.name(), true)
            .set("Sec-WebSocket-Accept", &accept_key(key), true);

        let context =
            WebSocketContext::new(Role::Server, factory, self.groups.clone(), self.config.clone());
        Ok(Box::new(context))
    }
}

/// Client side of `Upgrade: websocket`.
///
/// The sub-protocol is requested by setting `Sec-WebSocket-Protocol` on the request before
/// upgrading it, and created from the name the server answers with.
pub struct WebSocketClientFactory {
    sub_protocols: Rc<SubProtocolRegistry>,
    config: WebSocketConfig,
}

impl WebSocketClientFactory {
    pub fn new(sub_protocols: Rc<SubProtocolRegistry>) -> Self {
        Self {
            sub_protocols,
            config: WebSocketConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }
}

impl ClientUpgradeFactory for WebSocketClientFactory {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn prepare(&self, request: &mut ClientRequest) {
        request
            .set("Sec-WebSocket-Key", &generate_key())
            .set("Sec-WebSocket-Version", VERSION);
    }

    fn create(
        &self,
        request: &ClientRequest,
        response: &ClientResponse,
    ) -> Result<Box<dyn UpgradedContext>, UpgradeError> {
        if !response.header("upgrade").eq_ignore_ascii_case(PROTOCOL_NAME) {
            return Err(UpgradeError::Rejected(format!(
                "server switched to \"{}\"",
                response.header("upgrade")
            )));
        }

        let expected = accept_key(request.headers.get("sec-websocket-key"));
        if response.header("sec-websocket-accept") != expected {
            return Err(UpgradeError::AcceptMismatch);
        }

        let name = response.header("sec-websocket-protocol");
        let factory = self
            .sub_protocols
            .resolve(name)
            .ok_or_else(|| UpgradeError::UnknownProtocol(name.to_string()))?;

        let context = WebSocketContext::new(Role::Client, factory, None, self.config.clone());
        Ok(Box::new(context))
    }
}
