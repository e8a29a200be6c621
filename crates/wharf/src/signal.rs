use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::{Rc, Weak},
};

use anyhow::{anyhow, Error};
use thiserror::Error;
use thunderdome::{Arena, Index};
use tracing::{event, Level};

/// FIFO of actors waiting to be processed.
///
/// Every actor in a `World` has a slot here, marking if it's currently queued. An actor is in the
/// queue at most once, no matter how often it's signalled before being processed.
#[derive(Default)]
pub(crate) struct RunQueue {
    inner: Rc<RefCell<RunQueueInner>>,
}

#[derive(Default)]
struct RunQueueInner {
    queued: Arena<bool>,
    order: VecDeque<Index>,
}

impl RunQueue {
    pub fn track(&self, index: Index) {
        self.inner.borrow_mut().queued.insert_at(index, false);
    }

    pub fn untrack(&self, index: Index) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();

        match inner.queued.remove(index) {
            Some(true) => inner.order.retain(|queued| *queued != index),
            Some(false) => {}
            None => return Err(anyhow!("actor not tracked by run queue")),
        }

        Ok(())
    }

    pub fn signal(&self, index: Index) -> Signal {
        Signal {
            inner: Rc::downgrade(&self.inner),
            index,
        }
    }

    /// Take the actor at the front of the queue.
    pub fn pop(&self) -> Option<Index> {
        let mut inner = self.inner.borrow_mut();
        let index = inner.order.pop_front()?;

        if let Some(queued) = inner.queued.get_mut(index) {
            *queued = false;
        }

        Some(index)
    }
}

/// Schedules an actor for processing in a `World`.
#[derive(Clone)]
pub struct Signal {
    inner: Weak<RefCell<RunQueueInner>>,
    index: Index,
}

impl Signal {
    /// Send the signal.
    ///
    /// An actor that is already scheduled keeps its place in the queue. An actor signalled from
    /// within its own processing step is scheduled behind every other pending actor.
    pub fn send(&self) -> Result<(), SendError> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| anyhow!("world no longer exists"))?;
        let mut inner = inner.borrow_mut();

        let queued = inner
            .queued
            .get_mut(self.index)
            .ok_or_else(|| anyhow!("attempted to signal actor that does not exist"))?;

        if *queued {
            event!(Level::TRACE, "actor already signalled");
            return Ok(());
        }

        *queued = true;
        inner.order.push_back(self.index);

        Ok(())
    }
}

/// Error while sending signal.
#[derive(Error, Debug)]
#[error("sending signal failed")]
pub struct SendError {
    #[from]
    source: Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn given_tracked(queue: &RunQueue, arena: &mut Arena<()>) -> Index {
        let index = arena.insert(());
        queue.track(index);
        index
    }

    #[test]
    fn signalled_once_queued_once() {
        let queue = RunQueue::default();
        let mut arena = Arena::new();
        let a = given_tracked(&queue, &mut arena);
        let b = given_tracked(&queue, &mut arena);

        queue.signal(a).send().unwrap();
        queue.signal(b).send().unwrap();
        queue.signal(a).send().unwrap();

        assert_eq!(queue.pop(), Some(a));
        assert_eq!(queue.pop(), Some(b));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn signal_after_pop_requeues_at_back() {
        let queue = RunQueue::default();
        let mut arena = Arena::new();
        let a = given_tracked(&queue, &mut arena);
        let b = given_tracked(&queue, &mut arena);

        queue.signal(a).send().unwrap();
        queue.signal(b).send().unwrap();
        assert_eq!(queue.pop(), Some(a));

        queue.signal(a).send().unwrap();

        assert_eq!(queue.pop(), Some(b));
        assert_eq!(queue.pop(), Some(a));
    }

    #[test]
    fn untracked_actor_leaves_queue() {
        let queue = RunQueue::default();
        let mut arena = Arena::new();
        let a = given_tracked(&queue, &mut arena);

        let signal = queue.signal(a);
        signal.send().unwrap();
        queue.untrack(a).unwrap();

        assert_eq!(queue.pop(), None);
        assert!(signal.send().is_err());
        assert!(queue.untrack(a).is_err());
    }

    #[test]
    fn signal_fails_after_queue_dropped() {
        let queue = RunQueue::default();
        let mut arena = Arena::new();
        let a = given_tracked(&queue, &mut arena);

        let signal = queue.signal(a);
        drop(queue);

        assert!(signal.send().is_err());
    }
}
