use anyhow::Error;

use crate::{Signal, World};

/// Event handler living in a `World`.
///
/// Sockets, connections, and services are all actors. They communicate through mailboxes, and get
/// processed whenever a mailbox they're bound to receives a message, or a timer they set expires.
pub trait Actor: 'static {
    /// Called once when the actor is inserted into a `World`, before it can be processed.
    ///
    /// Bind the actor's mailboxes to `meta.signal()` here.
    #[allow(unused_variables)]
    fn register(&mut self, world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        Ok(())
    }

    /// Handle everything that's pending for this actor.
    ///
    /// Returning `Err` is fatal, the error is logged and the actor is stopped and dropped. Prefer
    /// this over panicking, a panic takes down every actor in the world.
    fn process(&mut self, world: &mut World, meta: &mut Meta) -> Result<(), Error>;
}

/// Per-step handle of an `Actor` to its own scheduling.
pub struct Meta {
    signal: Signal,
    stop: bool,
}

impl Meta {
    pub(crate) fn new(signal: Signal) -> Self {
        Self {
            signal,
            stop: false,
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop
    }

    /// Get a `Signal` that wakes the actor.
    pub fn signal(&self) -> Signal {
        self.signal.clone()
    }

    /// Stop and drop the actor once the current step returns.
    pub fn set_stop(&mut self) {
        self.stop = true;
    }
}
