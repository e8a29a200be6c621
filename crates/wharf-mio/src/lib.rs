//! Mio based event loop and non-blocking transport actors.

mod event_loop;
pub mod net;
mod registry;

pub use self::{
    event_loop::run_event_loop,
    registry::{Ready, Registry},
};
