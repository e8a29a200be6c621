mod mock;

use anyhow::{Context as _, Error};
use wharf::{message::Sender, World};

pub use self::mock::{given_actor, ActorInfo, Behavior};

pub fn when_sent_message_to(world: &mut World, sender: &Sender<()>) -> Result<(), Error> {
    sender.send(())?;

    world
        .run_until_idle()
        .context("failed to process after sending")?;

    Ok(())
}

pub fn then_actor_dropped(actor: &ActorInfo) {
    assert!(actor.dropped.get(), "actor not dropped");
}
