//! # switchboard
//!
//! **Switchboard** is an application runtime for composing dialog-driven
//! control programs out of independently activatable units (*jobs*) built
//! from reusable building blocks (*components*) that communicate only
//! through an asynchronous, pattern-addressed message bus, and that attach
//! to hot-pluggable peripherals through a manager abstracting connection
//! loss and peripheral re-appearance.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                    ┌─────────────────────────────────────┐
//!                    │                Core                 │
//!                    │  job registry · foreground history  │
//!                    └───────┬─────────────────────┬───────┘
//!                            ▼                     ▼
//!                   ┌────────────────┐    ┌────────────────┐
//!                   │   MessageBus   │    │ DeviceManager  │
//!                   │ FIFO queue +   │    │ registry +     │
//!                   │ reverse index  │    │ multicast      │
//!                   │ (worker task)  │    │ (listener task)│
//!                   └───────▲────────┘    └───────▲────────┘
//!            Listener/Slot  │                     │  DeviceHandle
//!                   ┌───────┴─────────────────────┴────────┐
//!                   │  Job ──► Component ──► send / handle │
//!                   └──────────────────────────────────────┘
//!                                               ▲
//!                            Connection (external peripheral link)
//! ```
//!
//! ### Lifecycle
//! ```text
//! Core::start()
//!   ├─► bus.initialize() + bus.start()      (delivery worker)
//!   ├─► manager.start()                     (connect + event listener)
//!   ├─► notify jobs on_core_started
//!   ├─► activate services (background jobs)
//!   └─► activate the default application
//!
//! Job::set_active(true)
//!   ├─► attach job listeners to the bus
//!   ├─► enable every component
//!   │     ├─► attach component listeners to the bus
//!   │     ├─► add device handles to the manager (replay bound peripherals)
//!   │     └─► run on_enabled
//!   └─► run on_activated
//!
//! Component::send("event", value)
//!   └─► bus queue ──► worker ──► index lookup ──► listener callbacks
//! ```
//!
//! Applications form the foreground layer: at most one is active at a time,
//! switching goes through [`Core::activate`] / [`Core::deactivate`], and a
//! history stack resolves "go back". Activator/deactivator [`Slot`]s let a
//! bus message bring an application to the foreground while it is inactive.
//!
//! ## Example
//! ```no_run
//! use switchboard::{Component, Config, Core, Job, Listener, Slot};
//! # fn connection() -> switchboard::ConnectionRef { unimplemented!() }
//!
//! # async fn run() -> Result<(), switchboard::RuntimeError> {
//! let core = Core::new(Config::default(), connection());
//!
//! let clock = Job::service("clock");
//! let menu = Job::app("menu");
//! let display = Component::new("display");
//! display.add_listener(Listener::new(
//!     Slot::new().with_job("clock").with_name("tick"),
//!     |msg| println!("tick: {}", msg.value()),
//! ));
//! menu.add_component(display)?;
//!
//! core.install(clock)?;
//! core.install(menu.clone())?;
//! core.set_default_app(&menu)?;
//!
//! core.start().await?;
//! core.wait_for_stop().await;
//! # Ok(())
//! # }
//! ```

mod config;
pub mod core;
pub mod devices;
mod error;
pub mod messages;

pub use crate::config::Config;
pub use crate::core::{Component, ComponentHook, Core, Job, JobHook};
pub use crate::devices::{
    Connection, ConnectionEvent, ConnectionRef, ConnectionState, Device, DeviceEventCallback,
    DeviceHandle, DeviceIdentity, DeviceManager, DeviceRef, DeviceType, EventCode, Multicast,
};
pub use crate::error::{DeviceError, RuntimeError};
pub use crate::messages::{Listener, Message, MessageBus, MultiListener, Slot, Value};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a panicking listener poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
