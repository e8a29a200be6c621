//! Switching connections to other protocols.
//!
//! Protocols are provided by factories, resolved by name from a `FactoryRegistry`. A successful
//! upgrade replaces the HTTP handling of a connection in-place with an `UpgradedContext`, the
//! transport connection stays open.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    ops::Deref,
    rc::Rc,
    time::Instant,
};

use anyhow::Error;
use bytes::Bytes;
use thiserror::Error;
use tracing::{event, Level};
use wharf::{message::Sender, Signal, World};
use wharf_mio::net::tcp::{SendAction, StreamAction};

use crate::{ClientRequest, ClientResponse, Request, Response};

/// Symbol suffix of server side HTTP upgrade factories.
pub const SERVER_UPGRADE_SUFFIX: &str = "ServerContextUpgradeFactory";

/// Symbol suffix of client side HTTP upgrade factories.
pub const CLIENT_UPGRADE_SUFFIX: &str = "ClientContextUpgradeFactory";

pub type ServerUpgradeRegistry = FactoryRegistry<dyn ServerUpgradeFactory>;
pub type ClientUpgradeRegistry = FactoryRegistry<dyn ClientUpgradeFactory>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("no upgrade requested")]
    NotRequested,
    #[error("no factory for protocol \"{0}\"")]
    UnknownProtocol(String),
    #[error("unsupported protocol version \"{0}\"")]
    UnsupportedVersion(String),
    #[error("accept key mismatch")]
    AcceptMismatch,
    #[error("upgrade rejected: {0}")]
    Rejected(String),
}

impl UpgradeError {
    /// Status code to answer a failed server side upgrade with.
    pub fn status(&self) -> u16 {
        match self {
            UpgradeError::UnknownProtocol(_) => 404,
            _ => 400,
        }
    }
}

/// Creates server side protocol contexts from upgrade requests.
pub trait ServerUpgradeFactory {
    /// Protocol name, as used in the `Upgrade` header.
    fn name(&self) -> &str;

    /// Validate the request and create the context that takes over the connection.
    ///
    /// The factory sets the `101` status and protocol headers on `response`, and may set advertised
    /// headers on failure.
    fn create(
        &self,
        request: &Request,
        response: &mut Response,
    ) -> Result<Box<dyn UpgradedContext>, UpgradeError>;
}

/// Creates client side protocol contexts from upgrade responses.
pub trait ClientUpgradeFactory {
    fn name(&self) -> &str;

    /// Add the protocol's headers to an upgrade request before it's sent.
    fn prepare(&self, request: &mut ClientRequest);

    /// Verify the server's answer and create the context that takes over the connection.
    fn create(
        &self,
        request: &ClientRequest,
        response: &ClientResponse,
    ) -> Result<Box<dyn UpgradedContext>, UpgradeError>;
}

/// Protocol handling of a connection after switching away from HTTP.
pub trait UpgradedContext {
    /// The context has been installed on the connection.
    #[allow(unused_variables)]
    fn on_connected(&mut self, io: &mut ContextIo) -> Result<(), Error> {
        Ok(())
    }

    /// Data has been received from the peer.
    fn on_received(&mut self, io: &mut ContextIo, data: Bytes) -> Result<(), Error>;

    /// The connection actor was woken, by a timer or by a mailbox bound to `ContextIo::signal`.
    #[allow(unused_variables)]
    fn on_process(&mut self, io: &mut ContextIo) -> Result<(), Error> {
        Ok(())
    }

    /// The transport connection is gone.
    #[allow(unused_variables)]
    fn on_disconnected(&mut self, io: &mut ContextIo) {}
}

/// Access to the connection for an `UpgradedContext`.
pub struct ContextIo<'a> {
    world: &'a mut World,
    signal: Signal,
    transport: &'a Sender<StreamAction>,
    close_requested: bool,
}

impl<'a> ContextIo<'a> {
    pub fn new(world: &'a mut World, signal: Signal, transport: &'a Sender<StreamAction>) -> Self {
        Self {
            world,
            signal,
            transport,
            close_requested: false,
        }
    }

    pub fn world(&mut self) -> &mut World {
        self.world
    }

    /// Signal that wakes the connection, bind mailboxes to this to receive `on_process` calls.
    pub fn signal(&self) -> Signal {
        self.signal.clone()
    }

    pub fn now(&self) -> Instant {
        self.world.now()
    }

    /// Wake the connection at `deadline`.
    pub fn set_timer(&mut self, deadline: Instant) {
        self.world.set_timer(deadline, self.signal.clone());
    }

    pub fn send(&mut self, data: Bytes) -> Result<(), Error> {
        let action = StreamAction::Send(SendAction { data });
        self.transport.send(action)?;
        Ok(())
    }

    /// Shut down the writing half of the connection, after pending data is sent.
    pub fn shutdown_write(&mut self) -> Result<(), Error> {
        self.transport.send(StreamAction::Shutdown)?;
        Ok(())
    }

    /// Close the connection, and tear down the context.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }
}

/// Loader of factories from dynamic libraries.
///
/// No loader ships with this crate, dynamic loading is platform specific.
pub trait PluginLoader<F: ?Sized> {
    /// Load `symbol` from `library`, returning the factory it creates.
    fn load(&mut self, library: &str, symbol: &str) -> Option<Rc<F>>;

    /// Close a previously loaded library.
    fn unload(&mut self, library: &str);
}

/// Library file name a plugin for `name` is loaded from.
pub fn plugin_library_name(name: &str) -> String {
    format!("libwharf-{}.so", name)
}

/// Named factories, with per factory user counts.
///
/// Resolving a name first checks factories already in use, then statically linked factories,
/// and finally the plugin loader if one is set. Removal of a factory is deferred until it has no
/// remaining users and `collect` is called.
pub struct FactoryRegistry<F: ?Sized> {
    symbol_suffix: &'static str,
    linked: RefCell<HashMap<String, Rc<F>>>,
    resolved: RefCell<HashMap<String, Entry<F>>>,
    loader: RefCell<Option<Box<dyn PluginLoader<F>>>>,
}

struct Entry<F: ?Sized> {
    factory: Rc<F>,
    users: Rc<Cell<usize>>,
    library: Option<String>,
    unload_requested: bool,
}

impl<F: ?Sized> FactoryRegistry<F> {
    pub fn new(symbol_suffix: &'static str) -> Self {
        Self {
            symbol_suffix,
            linked: RefCell::new(HashMap::new()),
            resolved: RefCell::new(HashMap::new()),
            loader: RefCell::new(None),
        }
    }

    /// Add a statically linked factory.
    pub fn link(&self, name: &str, factory: Rc<F>) {
        self.linked
            .borrow_mut()
            .insert(name.to_ascii_lowercase(), factory);
    }

    /// Allow resolving unknown names through a plugin loader.
    pub fn set_loader(&self, loader: Box<dyn PluginLoader<F>>) {
        *self.loader.borrow_mut() = Some(loader);
    }

    /// Resolve a factory by name, counting the returned handle as a user.
    pub fn resolve(&self, name: &str) -> Option<FactoryHandle<F>> {
        let name = name.to_ascii_lowercase();
        let mut resolved = self.resolved.borrow_mut();

        if !resolved.contains_key(&name) {
            let entry = self.find_unresolved(&name)?;
            resolved.insert(name.clone(), entry);
        }

        let entry = resolved.get_mut(&name)?;
        entry.unload_requested = false;

        Some(FactoryHandle::new(entry.factory.clone(), entry.users.clone()))
    }

    /// Resolve the first available protocol of an `Upgrade` header.
    pub fn select(&self, upgrade: &str) -> Option<FactoryHandle<F>> {
        upgrade_candidates(upgrade)
            .iter()
            .find_map(|name| self.resolve(name))
    }

    /// Number of live handles of a factory.
    pub fn users(&self, name: &str) -> usize {
        self.resolved
            .borrow()
            .get(&name.to_ascii_lowercase())
            .map(|entry| entry.users.get())
            .unwrap_or(0)
    }

    /// Request removal of a factory, once it no longer has users.
    pub fn request_unload(&self, name: &str) {
        if let Some(entry) = self
            .resolved
            .borrow_mut()
            .get_mut(&name.to_ascii_lowercase())
        {
            entry.unload_requested = true;
        }
    }

    /// Remove factories that were requested to unload and have no users left.
    pub fn collect(&self) {
        let mut removed = Vec::new();

        self.resolved.borrow_mut().retain(|name, entry| {
            let remove = entry.unload_requested && entry.users.get() == 0;
            if remove {
                event!(Level::DEBUG, %name, "unloading factory");
                removed.extend(entry.library.take());
            }
            !remove
        });

        if let Some(loader) = self.loader.borrow_mut().as_mut() {
            for library in removed {
                loader.unload(&library);
            }
        }
    }

    fn find_unresolved(&self, name: &str) -> Option<Entry<F>> {
        if let Some(factory) = self.linked.borrow().get(name) {
            return Some(Entry::new(factory.clone(), None));
        }

        let mut loader = self.loader.borrow_mut();
        let loader = loader.as_mut()?;

        let library = plugin_library_name(name);
        let symbol = format!("{}{}", name, self.symbol_suffix);
        let factory = loader.load(&library, &symbol)?;
        event!(Level::DEBUG, %library, %symbol, "loaded factory plugin");

        Some(Entry::new(factory, Some(library)))
    }
}

impl<F: ?Sized> Entry<F> {
    fn new(factory: Rc<F>, library: Option<String>) -> Self {
        Self {
            factory,
            users: Rc::new(Cell::new(0)),
            library,
            unload_requested: false,
        }
    }
}

/// Counted reference to a resolved factory.
pub struct FactoryHandle<F: ?Sized> {
    factory: Rc<F>,
    user: FactoryUser,
}

impl<F: ?Sized> FactoryHandle<F> {
    fn new(factory: Rc<F>, users: Rc<Cell<usize>>) -> Self {
        Self {
            factory,
            user: FactoryUser::new(users),
        }
    }

    /// Keep only the user count of this handle.
    pub fn into_user(self) -> FactoryUser {
        self.user
    }
}

impl<F: ?Sized> Clone for FactoryHandle<F> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            user: self.user.clone(),
        }
    }
}

impl<F: ?Sized> Deref for FactoryHandle<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.factory
    }
}

/// A single counted user of a factory, released on drop.
pub struct FactoryUser {
    users: Rc<Cell<usize>>,
}

impl FactoryUser {
    fn new(users: Rc<Cell<usize>>) -> Self {
        users.set(users.get() + 1);
        Self { users }
    }
}

impl Clone for FactoryUser {
    fn clone(&self) -> Self {
        Self::new(self.users.clone())
    }
}

impl Drop for FactoryUser {
    fn drop(&mut self) {
        self.users.set(self.users.get().saturating_sub(1));
    }
}

/// Split an `Upgrade` header into lowercase protocol names, dropping version suffixes.
pub fn upgrade_candidates(upgrade: &str) -> Vec<String> {
    upgrade
        .split(',')
        .filter_map(|candidate| candidate.split('/').next())
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

/// A switched connection context, holding on to its factory.
pub(crate) struct Upgraded {
    pub protocol: String,
    pub context: Box<dyn UpgradedContext>,
    pub _user: FactoryUser,
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named {
        fn name(&self) -> &str;
    }

    struct Fixed(&'static str);

    impl Named for Fixed {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loaded: Rc<RefCell<Vec<String>>>,
        unloaded: Rc<RefCell<Vec<String>>>,
    }

    impl PluginLoader<dyn Named> for CountingLoader {
        fn load(&mut self, library: &str, symbol: &str) -> Option<Rc<dyn Named>> {
            self.loaded.borrow_mut().push(format!("{} {}", library, symbol));
            Some(Rc::new(Fixed("plugged")))
        }

        fn unload(&mut self, library: &str) {
            self.unloaded.borrow_mut().push(library.to_string());
        }
    }

    #[test]
    fn candidates_are_normalized() {
        assert_eq!(
            upgrade_candidates(" WebSocket/13 , h2c,, foo/2"),
            ["websocket", "h2c", "foo"]
        );
    }

    #[test]
    fn select_takes_first_resolvable() {
        let registry = FactoryRegistry::<dyn Named>::new(SERVER_UPGRADE_SUFFIX);
        registry.link("websocket", Rc::new(Fixed("websocket")));

        let handle = registry.select("h2c, websocket").unwrap();
        assert_eq!(handle.name(), "websocket");
        assert!(registry.select("h2c").is_none());
    }

    #[test]
    fn unload_waits_for_users() {
        let registry = FactoryRegistry::<dyn Named>::new(SERVER_UPGRADE_SUFFIX);
        registry.link("websocket", Rc::new(Fixed("websocket")));

        let handle = registry.resolve("websocket").unwrap();
        let second = handle.clone();
        assert_eq!(registry.users("websocket"), 2);

        registry.request_unload("websocket");
        drop(handle);
        registry.collect();
        assert_eq!(registry.users("websocket"), 1);

        drop(second);
        assert_eq!(registry.users("websocket"), 0);
        registry.collect();
        assert!(registry.resolved.borrow().is_empty());
    }

    #[test]
    fn plugins_load_by_convention() {
        let registry = FactoryRegistry::<dyn Named>::new(SERVER_UPGRADE_SUFFIX);
        let loader = CountingLoader::default();
        let loaded = loader.loaded.clone();
        let unloaded = loader.unloaded.clone();
        registry.set_loader(Box::new(loader));

        let handle = registry.resolve("Echo").unwrap();
        assert_eq!(handle.name(), "plugged");
        assert_eq!(
            *loaded.borrow(),
            ["libwharf-echo.so echoServerContextUpgradeFactory"]
        );

        // Resolving again reuses the loaded factory
        let _second = registry.resolve("echo").unwrap();
        assert_eq!(loaded.borrow().len(), 1);

        registry.request_unload("echo");
        drop(handle);
        drop(_second);
        registry.collect();
        assert_eq!(*unloaded.borrow(), ["libwharf-echo.so"]);
    }
}
