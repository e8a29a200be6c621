//! Non-blocking TCP listener and stream actors.

mod listener;
mod stream;

pub use self::{
    listener::{listen, ConnectedEvent, ListenerAction, ListenerEvent, ListenerInfo},
    stream::{connect, RecvEvent, SendAction, StreamAction, StreamEvent},
};
