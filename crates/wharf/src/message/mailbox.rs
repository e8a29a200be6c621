use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::{Rc, Weak},
};

use anyhow::{anyhow, Context as _, Error};
use thiserror::Error;

use crate::Signal;

/// Shared *single-threaded* multi-sender message queue.
///
/// The `Mailbox` owns the queue, `Sender`s only hold a weak reference to it. Once all clones of
/// the mailbox are dropped, sending to it fails.
///
/// A mailbox has to be bound before it accepts messages, either to the signal of the actor
/// reading it, or as floating when it's read without being woken.
pub struct Mailbox<M> {
    inner: Rc<RefCell<Queue<M>>>,
}

struct Queue<M> {
    messages: VecDeque<M>,
    binding: Binding,
}

enum Binding {
    Unbound,
    Actor(Signal),
    Floating,
}

impl<M> Default for Mailbox<M> {
    fn default() -> Self {
        let queue = Queue {
            messages: VecDeque::new(),
            binding: Binding::Unbound,
        };

        Self {
            inner: Rc::new(RefCell::new(queue)),
        }
    }
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> Mailbox<M> {
    /// Create a mailbox that isn't bound to any actor.
    ///
    /// Messages are queued until read, this is useful when handing a mailbox over to another
    /// actor that binds its own signal later.
    pub fn floating() -> Self {
        let mailbox = Self::default();
        mailbox.set_floating();
        mailbox
    }

    /// Create a new `Sender` that sends to this mailbox.
    pub fn sender(&self) -> Sender<M> {
        Sender {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Bind the mailbox to the actor woken by `signal`, replacing any previous binding.
    ///
    /// Messages queued while the mailbox was floating wake the actor immediately.
    pub fn set_signal(&self, signal: Signal) -> Result<(), SendError> {
        let mut inner = self.inner.borrow_mut();

        if !inner.messages.is_empty() {
            signal
                .send()
                .context("failed to wake newly bound actor")?;
        }

        inner.binding = Binding::Actor(signal);
        Ok(())
    }

    /// Accept messages without waking anything.
    pub fn set_floating(&self) {
        self.inner.borrow_mut().binding = Binding::Floating;
    }

    /// Take the oldest queued message.
    pub fn recv(&self) -> Option<M> {
        self.inner.borrow_mut().messages.pop_front()
    }

    /// Returns true if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().messages.is_empty()
    }
}

/// Weak handle for sending messages to a `Mailbox`.
pub struct Sender<M> {
    inner: Weak<RefCell<Queue<M>>>,
}

impl<M> Sender<M> {
    /// Queue `message`, waking the bound actor.
    pub fn send(&self, message: M) -> Result<(), SendError> {
        let inner = self.inner.upgrade().context("mailbox closed")?;
        let mut inner = inner.borrow_mut();

        // Wake first, a failed wake leaves the queue untouched
        match &inner.binding {
            Binding::Unbound => {
                return Err(anyhow!("mailbox isn't bound to an actor or floating").into());
            }
            Binding::Actor(signal) => signal.send().context("failed to wake bound actor")?,
            Binding::Floating => {}
        }

        inner.messages.push_back(message);

        Ok(())
    }

    /// Returns true if the receiving mailbox no longer exists.
    pub fn is_closed(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl<M> Clone for Sender<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Error while sending a message.
///
/// This happens if the receiving mailbox no longer exists, or its actor is gone.
#[derive(Error, Debug)]
#[error("sending message failed")]
pub struct SendError {
    #[from]
    source: Error,
}
