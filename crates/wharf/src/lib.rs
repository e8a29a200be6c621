#![deny(missing_docs)]

//! A minimal, single-threaded, non-exclusive actor runtime.
//!
//! Actors are inserted into a `World`, and are processed whenever their `Signal` is sent.
//! Processing is cooperative, an actor runs until its `process` step returns, and then the next
//! signalled actor is processed. Nothing in this crate blocks.

mod actor;
pub mod message;
mod signal;
mod timer;
mod world;

pub use self::{
    actor::{Actor, Meta},
    signal::{SendError, Signal},
    world::{Id, InsertError, ProcessError, World},
};
