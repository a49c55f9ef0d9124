//! The activation state machine: [`Core`], [`Job`], [`Component`], and
//! signal-driven shutdown.

mod component;
mod job;
mod runtime;
mod shutdown;

pub use component::{Component, ComponentHook};
pub use job::{Job, JobHook};
pub use runtime::Core;
pub use shutdown::wait_for_shutdown_signal;
