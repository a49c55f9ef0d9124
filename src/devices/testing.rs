//! In-memory connection stack used by the crate's tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::connection::{
    ConnectReason, Connection, ConnectionEvent, ConnectionState, Device, DeviceEventCallback,
    DeviceIdentity, DeviceRef, DeviceType, DisconnectReason, EnumerationKind, EventCode,
};
use crate::error::DeviceError;
use crate::lock;
use crate::messages::Value;

pub(crate) struct FakeDevice {
    identity: DeviceIdentity,
    callbacks: Mutex<HashMap<EventCode, DeviceEventCallback>>,
}

impl FakeDevice {
    pub(crate) fn new(uid: &str, device_type: DeviceType) -> Self {
        Self {
            identity: DeviceIdentity {
                uid: uid.to_string(),
                connected_uid: "0".to_string(),
                position: 'a',
                hardware_version: [1, 0, 0],
                firmware_version: [2, 0, 0],
                device_type,
            },
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Simulates the hardware firing an event.
    pub(crate) fn fire(&self, event: EventCode, value: &Value) {
        let callback = lock(&self.callbacks).get(&event).cloned();
        if let Some(callback) = callback {
            callback(value);
        }
    }

    pub(crate) fn has_callback(&self, event: EventCode) -> bool {
        lock(&self.callbacks).contains_key(&event)
    }
}

impl Device for FakeDevice {
    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    fn register_callback(&self, event: EventCode, callback: Option<DeviceEventCallback>) {
        let mut callbacks = lock(&self.callbacks);
        match callback {
            Some(callback) => {
                callbacks.insert(event, callback);
            }
            None => {
                callbacks.remove(&event);
            }
        }
    }
}

/// Scriptable connection: tests declare the peripherals it knows about and
/// push connect/disconnect/enumeration events through the broadcast channel.
pub(crate) struct FakeConnection {
    state: Mutex<ConnectionState>,
    tx: broadcast::Sender<ConnectionEvent>,
    devices: Mutex<HashMap<String, Arc<FakeDevice>>>,
    known: Mutex<Vec<DeviceIdentity>>,
}

impl FakeConnection {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(ConnectionState::Disconnected),
            tx,
            devices: Mutex::new(HashMap::new()),
            known: Mutex::new(Vec::new()),
        })
    }

    /// Declares a peripheral the connection will report on `enumerate()`.
    pub(crate) fn add_known(&self, uid: &str, device_type: DeviceType) {
        let device = Arc::new(FakeDevice::new(uid, device_type));
        lock(&self.known).push(device.identity());
        lock(&self.devices).insert(uid.to_string(), device);
    }

    /// The instance `create_device` hands out for a UID.
    pub(crate) fn device(&self, uid: &str) -> Arc<FakeDevice> {
        lock(&self.devices)[uid].clone()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }

    /// Hot-plug notification for a known peripheral.
    pub(crate) fn emit_present(&self, uid: &str) {
        self.emit(ConnectionEvent::Enumerate {
            identity: self.device(uid).identity(),
            kind: EnumerationKind::Connected,
        });
    }

    pub(crate) fn emit_absent(&self, uid: &str) {
        self.emit(ConnectionEvent::Enumerate {
            identity: self.device(uid).identity(),
            kind: EnumerationKind::Disconnected,
        });
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn connect(&self, _host: &str, _port: u16) -> Result<(), DeviceError> {
        *lock(&self.state) = ConnectionState::Connected;
        self.emit(ConnectionEvent::Connected {
            reason: ConnectReason::Request,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        *lock(&self.state) = ConnectionState::Disconnected;
        self.emit(ConnectionEvent::Disconnected {
            reason: DisconnectReason::Request,
        });
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_auto_reconnect(&self, _enabled: bool) {}

    async fn enumerate(&self) -> Result<(), DeviceError> {
        for identity in lock(&self.known).clone() {
            self.emit(ConnectionEvent::Enumerate {
                identity,
                kind: EnumerationKind::Available,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    fn create_device(&self, device_type: DeviceType, uid: &str) -> Result<DeviceRef, DeviceError> {
        match lock(&self.devices).get(uid) {
            Some(device) if device.identity.device_type == device_type => {
                Ok(Arc::clone(device) as DeviceRef)
            }
            _ => Err(DeviceError::UnknownDeviceType(device_type)),
        }
    }
}

/// Lets the current-thread runtime drain spawned tasks and event chains.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
