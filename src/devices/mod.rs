//! Peripheral lifecycle: the manager, device handles, the multicast
//! dispatcher, and the external connection boundary.

mod connection;
mod handle;
mod manager;
mod multicast;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{
    ConnectReason, Connection, ConnectionEvent, ConnectionRef, ConnectionState, Device,
    DeviceEventCallback, DeviceIdentity, DeviceRef, DeviceType, DisconnectReason, EnumerationKind,
    EventCode,
};
pub use handle::{BindCallback, DeviceHandle};
pub use manager::{DeviceHook, DeviceManager};
pub use multicast::Multicast;
