use std::time::Instant;

use anyhow::Error;
use mio::Events;
use tracing::{event, instrument, Level};
use wharf::World;

use crate::{Ready, Registry};

/// Run the world on mio readiness and timers, until no actors are left.
#[instrument("mio-event-loop", skip_all)]
pub fn run_event_loop(world: &mut World, registry: &Registry) -> Result<(), Error> {
    let mut events = Events::with_capacity(128);

    loop {
        // Fire timers and process everything that's pending
        world.advance_to(Instant::now());
        event!(Level::TRACE, "processing pending actors");
        world.run_until_idle()?;

        if world.is_empty() {
            event!(Level::DEBUG, "no actors left, stopping event loop");
            return Ok(());
        }

        // Sleep until the next readiness event, or the next timer
        let timeout = world
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        registry.poll(&mut events, timeout)?;

        for event in events.iter() {
            let ready = Ready {
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_error(),
            };
            registry.wake(event.token(), ready)?;
        }
    }
}
