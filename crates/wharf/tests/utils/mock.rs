use std::{cell::Cell, rc::Rc};

use anyhow::{bail, Error};
use wharf::{
    message::{Mailbox, Sender},
    Actor, Id, Meta, World,
};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Count one batch of messages, then stop.
    CountOnce,
    /// Fail the first processing step.
    FailProcess,
    /// Fail while being inserted.
    FailRegister,
}

pub struct ActorInfo {
    pub id: Option<Id>,
    pub sender: Sender<()>,
    pub received: Rc<Cell<usize>>,
    pub dropped: Rc<Cell<bool>>,
}

pub fn given_actor(world: &mut World, behavior: Behavior) -> ActorInfo {
    let actor = MockActor {
        mailbox: Mailbox::default(),
        received: Rc::default(),
        dropped: Rc::default(),
        behavior,
    };

    let sender = actor.mailbox.sender();
    let received = actor.received.clone();
    let dropped = actor.dropped.clone();
    let id = world.insert("mock-actor", actor).ok();

    ActorInfo {
        id,
        sender,
        received,
        dropped,
    }
}

struct MockActor {
    mailbox: Mailbox<()>,
    received: Rc<Cell<usize>>,
    dropped: Rc<Cell<bool>>,
    behavior: Behavior,
}

impl Actor for MockActor {
    fn register(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        if self.behavior == Behavior::FailRegister {
            bail!("mock refused registration");
        }

        self.mailbox.set_signal(meta.signal())?;
        Ok(())
    }

    fn process(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        if self.behavior == Behavior::FailProcess {
            bail!("mock intentional fail");
        }

        while self.mailbox.recv().is_some() {
            self.received.set(self.received.get() + 1);
        }
        meta.set_stop();

        Ok(())
    }
}

impl Drop for MockActor {
    fn drop(&mut self) {
        self.dropped.set(true);
    }
}
