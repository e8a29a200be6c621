use std::time::Instant;

use anyhow::{Context as _, Error};
use thiserror::Error;
use thunderdome::{Arena, Index};
use tracing::{event, instrument, span, Level};

use crate::{signal::RunQueue, timer::Timers, Actor, Meta, Signal};

/// Thread-local actor collection and execution system.
pub struct World {
    actors: Arena<ActorEntry>,
    queue: RunQueue,
    timers: Timers,
    now: Instant,
}

struct ActorEntry {
    name: &'static str,
    actor: Option<Box<dyn Actor>>,
}

impl Default for World {
    fn default() -> Self {
        Self {
            actors: Arena::new(),
            queue: RunQueue::default(),
            timers: Timers::default(),
            now: Instant::now(),
        }
    }
}

impl Drop for World {
    fn drop(&mut self) {
        let mut names = Vec::new();

        for (_, entry) in &self.actors {
            names.push(entry.name);
        }

        if !names.is_empty() {
            event!(
                Level::WARN,
                ?names,
                "actors not cleaned up before world drop",
            );
        }
    }
}

impl World {
    /// Insert an actor into the world.
    ///
    /// The given `name` will be used in logging.
    /// If the actor fails to register, it's removed again and the error is returned.
    #[instrument("World::insert", level = "debug", skip_all)]
    pub fn insert<A>(&mut self, name: &'static str, actor: A) -> Result<Id, InsertError>
    where
        A: Actor,
    {
        event!(Level::DEBUG, name, "inserting actor");

        let entry = ActorEntry { name, actor: None };
        let index = self.actors.insert(entry);
        self.queue.track(index);

        // Let the actor bind its signal before it's made available
        let mut actor = Box::new(actor);
        let mut meta = Meta::new(self.queue.signal(index));
        if let Err(error) = actor.register(self, &mut meta) {
            self.actors.remove(index);
            self.queue.untrack(index)?;
            return Err(error.context("actor failed to register").into());
        }

        let entry = self
            .actors
            .get_mut(index)
            .context("actor removed during registration")?;
        entry.actor = Some(actor);

        let id = Id { index };

        // Stopping in register is allowed, the actor just never gets processed
        if meta.stop_requested() {
            self.remove(id);
        }

        Ok(id)
    }

    /// Get a `Signal` that schedules the actor for processing.
    pub fn signal(&self, id: Id) -> Signal {
        self.queue.signal(id.index)
    }

    /// Returns true if the actor is still alive in this world.
    pub fn contains(&self, id: Id) -> bool {
        self.actors.contains(id.index)
    }

    /// Returns true if no actors are left in this world.
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// The current time of this world, as last set by `advance_to`.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Send `signal` once the world's time reaches `deadline`.
    pub fn set_timer(&mut self, deadline: Instant, signal: Signal) {
        self.timers.insert(deadline, signal);
    }

    /// The earliest pending timer deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Move the world's time forward, sending the signals of every expired timer.
    pub fn advance_to(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }

        for signal in self.timers.expire(self.now) {
            // The actor may have stopped since setting the timer
            if let Err(error) = signal.send() {
                event!(Level::TRACE, ?error, "dropping stale timer");
            }
        }
    }

    /// Process all pending signalled actors, until none are left pending.
    #[instrument("World::run_until_idle", level = "debug", skip_all)]
    pub fn run_until_idle(&mut self) -> Result<(), ProcessError> {
        while let Some(index) = self.queue.pop() {
            self.process_actor(index).context("failed to process")?;
        }

        Ok(())
    }

    fn process_actor(&mut self, index: Index) -> Result<(), Error> {
        let entry = self.actors.get_mut(index).context("failed to find actor")?;
        let name = entry.name;
        let mut actor = entry.actor.take().context("actor unavailable")?;

        let span = span!(Level::INFO, "actor", name);
        let _entered = span.enter();
        event!(Level::TRACE, "processing actor");

        let mut meta = Meta::new(self.queue.signal(index));
        let result = actor.process(self, &mut meta);

        // Return the actor now that we're done with it
        let entry = self
            .actors
            .get_mut(index)
            .context("failed to find actor for return")?;
        entry.actor = Some(actor);

        let mut stop = meta.stop_requested();
        if let Err(error) = result {
            event!(Level::ERROR, "error in actor:\n{:?}", error);
            stop = true;
        }

        if stop {
            self.remove(Id { index });
        }

        Ok(())
    }

    fn remove(&mut self, id: Id) {
        let Some(entry) = self.actors.remove(id.index) else {
            return;
        };

        if let Err(error) = self.queue.untrack(id.index) {
            event!(Level::WARN, ?error, "actor signal state missing");
        }

        event!(Level::DEBUG, name = entry.name, "removed actor");

        // Dropping may send messages to other actors, so do it after our own bookkeeping
        drop(entry);
    }
}

/// Identifier of an actor inserted into a world.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Id {
    index: Index,
}

/// Failed to insert an actor.
#[derive(Error, Debug)]
#[error("failed to insert actor")]
pub struct InsertError {
    #[from]
    source: Error,
}

/// Failed to process actors.
#[derive(Error, Debug)]
#[error("failed to process actors")]
pub struct ProcessError {
    #[from]
    source: Error,
}
