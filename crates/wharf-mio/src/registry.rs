use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    time::Duration,
};

use anyhow::{Context as _, Error};
use mio::{event::Source, Events, Interest, Poll, Token};
use tracing::{event, Level};
use wharf::message::Sender;

/// Shared mio context registry.
///
/// Actors use an instance of this registry to register for readiness events.
/// Readiness is delivered to the registered mailbox, which wakes the owning actor.
pub struct Registry {
    poll: RefCell<Poll>,
    next_token: Cell<usize>,
    wakers: RefCell<HashMap<Token, Sender<Ready>>>,
}

impl Registry {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new().context("failed to create poll")?;

        let value = Self {
            poll: RefCell::new(poll),
            next_token: Cell::new(0),
            wakers: Default::default(),
        };
        Ok(value)
    }

    pub(crate) fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<(), Error> {
        self.poll.borrow_mut().poll(events, timeout)?;
        Ok(())
    }

    pub(crate) fn wake(&self, token: Token, ready: Ready) -> Result<(), Error> {
        event!(Level::TRACE, ?token, "sending wake");

        let wakers = self.wakers.borrow();
        let Some(sender) = wakers.get(&token) else {
            // Spurious events for just-deregistered sources can still arrive
            event!(Level::TRACE, ?token, "no waker for token");
            return Ok(());
        };

        sender.send(ready).context("failed to send ready")?;

        Ok(())
    }

    /// Register a source, readiness events will be sent to `ready`.
    pub fn register<S>(
        &self,
        source: &mut S,
        interest: Interest,
        ready: Sender<Ready>,
    ) -> Result<Token, Error>
    where
        S: Source,
    {
        let token = Token(self.next_token.get());
        self.next_token.set(token.0 + 1);

        self.wakers.borrow_mut().insert(token, ready);

        self.poll
            .borrow()
            .registry()
            .register(source, token, interest)?;

        Ok(token)
    }

    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> Result<(), Error>
    where
        S: Source,
    {
        self.poll
            .borrow()
            .registry()
            .reregister(source, token, interest)?;
        Ok(())
    }

    pub fn deregister<S>(&self, source: &mut S, token: Token) -> Result<(), Error>
    where
        S: Source,
    {
        self.wakers.borrow_mut().remove(&token);
        self.poll.borrow().registry().deregister(source)?;
        Ok(())
    }
}

/// Readiness of a registered source.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
}
