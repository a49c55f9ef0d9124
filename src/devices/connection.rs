//! The peripheral connection boundary.
//!
//! Everything behind [`Connection`] is an external collaborator: the wire
//! protocol, reconnection, and the concrete peripheral classes live outside
//! this crate. The [`DeviceManager`](super::DeviceManager) consumes this
//! surface and nothing more, so tests drive it with an in-memory fake.
//!
//! The contract mirrors the usual shape of hot-pluggable device buses:
//! - enumeration is asynchronous (one [`ConnectionEvent::Enumerate`] per
//!   known peripheral after [`Connection::enumerate`]),
//! - each peripheral exposes one native callback slot per event code,
//! - a distinguished [`DeviceError::ConnectionLost`] marks the error that
//!   hook handling suppresses.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::DeviceError;
use crate::messages::Value;

/// Numeric peripheral type identifier.
pub type DeviceType = u16;

/// Numeric event code within one peripheral type.
pub type EventCode = u8;

/// Callback invoked with a hardware event payload.
pub type DeviceEventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identity of one peripheral as reported by enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub uid: String,
    pub connected_uid: String,
    pub position: char,
    pub hardware_version: [u8; 3],
    pub firmware_version: [u8; 3],
    pub device_type: DeviceType,
}

/// A typed binding to one live peripheral.
///
/// `register_callback` is single-slot per event code: registering replaces
/// the previous callback, `None` clears it. The manager multiplexes many
/// subscribers onto this one slot via [`Multicast`](super::Multicast).
pub trait Device: Send + Sync {
    fn identity(&self) -> DeviceIdentity;
    fn register_callback(&self, event: EventCode, callback: Option<DeviceEventCallback>);
}

pub type DeviceRef = Arc<dyn Device>;

/// Connection state as reported by the external stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Pending,
    Connected,
}

/// Why an enumeration entry was delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnumerationKind {
    /// Answer to an explicit `enumerate()` call.
    Available,
    /// The peripheral appeared (hot plug or reconnect).
    Connected,
    /// The peripheral disappeared.
    Disconnected,
}

/// Why the connection came up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectReason {
    Request,
    AutoReconnect,
}

/// Why the connection went down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    Request,
    Shutdown,
    Error,
}

/// Event stream multiplexed over [`Connection::subscribe`].
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Enumerate {
        identity: DeviceIdentity,
        kind: EnumerationKind,
    },
    Connected {
        reason: ConnectReason,
    },
    Disconnected {
        reason: DisconnectReason,
    },
}

/// Minimum surface the manager needs from the external connection stack.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<(), DeviceError>;
    async fn disconnect(&self) -> Result<(), DeviceError>;
    fn state(&self) -> ConnectionState;
    fn set_auto_reconnect(&self, enabled: bool);

    /// Requests asynchronous enumeration of every present peripheral.
    async fn enumerate(&self) -> Result<(), DeviceError>;

    /// Subscribes to connection and enumeration events.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Produces the typed binding for a peripheral.
    fn create_device(&self, device_type: DeviceType, uid: &str) -> Result<DeviceRef, DeviceError>;
}

pub type ConnectionRef = Arc<dyn Connection>;
