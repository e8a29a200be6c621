//! Messaging utilities.

mod mailbox;

pub use self::mailbox::{Mailbox, SendError, Sender};
