//! Messaging: the bus, subscription patterns, and the reverse index
//! backing pattern matching.

mod bus;
mod index;
mod listener;
mod message;
mod slot;

pub use bus::MessageBus;
pub use listener::{Listener, MessageCallback, MultiListener};
pub use message::{Message, Value};
pub use slot::{Predicate, Slot, Transform};
