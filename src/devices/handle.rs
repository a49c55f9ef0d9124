//! Device handles: a component's declared interest in peripherals.
//!
//! A [`DeviceHandle`] names a peripheral type (optionally a specific UID),
//! carries bind/unbind callbacks and per-event-code subscriptions, and
//! tracks the peripherals currently bound to it. The
//! [`DeviceManager`](super::DeviceManager) feeds it: handles are registered
//! when their component becomes enabled, replayed against every present
//! peripheral, and notified of every future appearance and disappearance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use super::connection::{DeviceEventCallback, DeviceIdentity, DeviceRef, DeviceType, EventCode};
use super::manager::{DeviceManager, ManagerShared};
use crate::error::DeviceError;
use crate::lock;
use crate::messages::Value;

/// Callback invoked when a peripheral binds to or unbinds from a handle.
pub type BindCallback = Arc<dyn Fn(&DeviceRef) + Send + Sync>;

enum Binding {
    /// At most one bound peripheral; `uid` restricts to one specific unit.
    Single { uid: Option<String> },
    /// Every peripheral of the handle's type.
    Multi,
}

/// Declared interest in peripherals of one type.
///
/// Cheap to clone; clones share the binding state.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    name: String,
    device_type: DeviceType,
    binding: Binding,
    bind_callback: Mutex<Option<BindCallback>>,
    unbind_callback: Mutex<Option<BindCallback>>,
    callbacks: Mutex<HashMap<EventCode, DeviceEventCallback>>,
    devices: Mutex<Vec<DeviceRef>>,
    manager: Mutex<Weak<ManagerShared>>,
}

impl DeviceHandle {
    fn with_binding(name: impl Into<String>, device_type: DeviceType, binding: Binding) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name: name.into(),
                device_type,
                binding,
                bind_callback: Mutex::new(None),
                unbind_callback: Mutex::new(None),
                callbacks: Mutex::new(HashMap::new()),
                devices: Mutex::new(Vec::new()),
                manager: Mutex::new(Weak::new()),
            }),
        }
    }

    /// Handle for the first peripheral of the given type.
    pub fn single(name: impl Into<String>, device_type: DeviceType) -> Self {
        Self::with_binding(name, device_type, Binding::Single { uid: None })
    }

    /// Handle for one specific peripheral.
    pub fn single_with_uid(
        name: impl Into<String>,
        device_type: DeviceType,
        uid: impl Into<String>,
    ) -> Self {
        Self::with_binding(
            name,
            device_type,
            Binding::Single {
                uid: Some(uid.into()),
            },
        )
    }

    /// Handle for every peripheral of the given type.
    pub fn multi(name: impl Into<String>, device_type: DeviceType) -> Self {
        Self::with_binding(name, device_type, Binding::Multi)
    }

    /// Sets the callback invoked after a peripheral binds.
    pub fn with_bind_callback(self, callback: impl Fn(&DeviceRef) + Send + Sync + 'static) -> Self {
        *lock(&self.inner.bind_callback) = Some(Arc::new(callback));
        self
    }

    /// Sets the callback invoked after a peripheral unbinds.
    pub fn with_unbind_callback(
        self,
        callback: impl Fn(&DeviceRef) + Send + Sync + 'static,
    ) -> Self {
        *lock(&self.inner.unbind_callback) = Some(Arc::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.inner.device_type
    }

    /// The currently bound peripheral, if any (first one for `multi`).
    pub fn device(&self) -> Option<DeviceRef> {
        lock(&self.inner.devices).first().cloned()
    }

    /// Every currently bound peripheral.
    pub fn devices(&self) -> Vec<DeviceRef> {
        lock(&self.inner.devices).clone()
    }

    /// Subscribes to a hardware event on every bound peripheral, current and
    /// future. Replaces a previous subscription for the same event code.
    pub fn register_callback(
        &self,
        event: EventCode,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) {
        let callback: DeviceEventCallback = Arc::new(callback);
        let previous = lock(&self.inner.callbacks).insert(event, Arc::clone(&callback));
        let Some(manager) = self.manager() else {
            return;
        };
        for device in self.devices() {
            let uid = device.identity().uid;
            if let Some(old) = &previous {
                manager.remove_device_callback(&uid, event, old);
            }
            manager.add_device_callback(&uid, event, Arc::clone(&callback));
        }
    }

    /// Drops the subscription for an event code on every bound peripheral.
    pub fn unregister_callback(&self, event: EventCode) {
        let Some(callback) = lock(&self.inner.callbacks).remove(&event) else {
            return;
        };
        let Some(manager) = self.manager() else {
            return;
        };
        for device in self.devices() {
            manager.remove_device_callback(&device.identity().uid, event, &callback);
        }
    }

    /// Applies `op` to every bound peripheral. `ConnectionLost` is expected
    /// during teardown races and suppressed; other errors are logged and the
    /// iteration continues.
    pub fn for_each_device(&self, op: impl Fn(&DeviceRef) -> Result<(), DeviceError>) {
        for device in self.devices() {
            match op(&device) {
                Ok(()) => {}
                Err(err) if err.is_connection_lost() => {}
                Err(err) => warn!(
                    target: "device",
                    handle = %self.inner.name,
                    uid = %device.identity().uid,
                    error = %err,
                    "device operation failed"
                ),
            }
        }
    }

    fn manager(&self) -> Option<DeviceManager> {
        DeviceManager::upgrade(&lock(&self.inner.manager))
    }

    fn accepts(&self, identity: &DeviceIdentity) -> bool {
        if identity.device_type != self.inner.device_type {
            return false;
        }
        let devices = lock(&self.inner.devices);
        if devices.iter().any(|d| d.identity().uid == identity.uid) {
            return false;
        }
        match &self.inner.binding {
            Binding::Single { uid: Some(uid) } => devices.is_empty() && *uid == identity.uid,
            Binding::Single { uid: None } => devices.is_empty(),
            Binding::Multi => true,
        }
    }

    pub(super) fn on_attach(&self, manager: &DeviceManager) {
        *lock(&self.inner.manager) = manager.downgrade();
    }

    pub(super) fn on_detach(&self) {
        *lock(&self.inner.manager) = Weak::new();
    }

    /// Offers a newly present peripheral; binds it when the handle matches.
    pub(super) fn on_bind_device(&self, manager: &DeviceManager, device: &DeviceRef) {
        let identity = device.identity();
        if !self.accepts(&identity) {
            return;
        }
        lock(&self.inner.devices).push(Arc::clone(device));
        let callbacks = lock(&self.inner.callbacks).clone();
        for (event, callback) in callbacks {
            manager.add_device_callback(&identity.uid, event, callback);
        }
        let bind = lock(&self.inner.bind_callback).clone();
        if let Some(callback) = bind {
            callback(device);
        }
    }

    /// Withdraws a disappeared peripheral; unbinds it when it was bound.
    pub(super) fn on_unbind_device(&self, manager: &DeviceManager, device: &DeviceRef) {
        let uid = device.identity().uid;
        let bound = {
            let mut devices = lock(&self.inner.devices);
            devices
                .iter()
                .position(|d| d.identity().uid == uid)
                .map(|pos| devices.remove(pos))
        };
        let Some(device) = bound else {
            return;
        };
        let callbacks = lock(&self.inner.callbacks).clone();
        for (event, callback) in callbacks {
            manager.remove_device_callback(&uid, event, &callback);
        }
        let unbind = lock(&self.inner.unbind_callback).clone();
        if let Some(callback) = unbind {
            callback(&device);
        }
    }
}

/// Identity equality, matching listener semantics: removal from the manager
/// requires the instance that was added.
impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DeviceHandle {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::connection::Device;
    use crate::devices::testing::FakeDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity(uid: &str, device_type: DeviceType) -> DeviceIdentity {
        FakeDevice::new(uid, device_type).identity()
    }

    #[test]
    fn single_accepts_first_matching_type_only() {
        let handle = DeviceHandle::single("lcd", 212);
        assert!(handle.accepts(&identity("a", 212)));
        assert!(!handle.accepts(&identity("a", 13)));

        lock(&handle.inner.devices).push(Arc::new(FakeDevice::new("a", 212)) as DeviceRef);
        assert!(!handle.accepts(&identity("b", 212)));
    }

    #[test]
    fn single_with_uid_filters_on_uid() {
        let handle = DeviceHandle::single_with_uid("lcd", 212, "abc");
        assert!(!handle.accepts(&identity("other", 212)));
        assert!(handle.accepts(&identity("abc", 212)));
    }

    #[test]
    fn multi_accepts_every_unit_once() {
        let handle = DeviceHandle::multi("buttons", 13);
        assert!(handle.accepts(&identity("a", 13)));
        lock(&handle.inner.devices).push(Arc::new(FakeDevice::new("a", 13)) as DeviceRef);
        // Same unit is never bound twice.
        assert!(!handle.accepts(&identity("a", 13)));
        assert!(handle.accepts(&identity("b", 13)));
    }

    #[test]
    fn for_each_device_suppresses_connection_lost() {
        let handle = DeviceHandle::multi("buttons", 13);
        lock(&handle.inner.devices).push(Arc::new(FakeDevice::new("a", 13)) as DeviceRef);
        lock(&handle.inner.devices).push(Arc::new(FakeDevice::new("b", 13)) as DeviceRef);

        let visited = AtomicUsize::new(0);
        handle.for_each_device(|device| {
            visited.fetch_add(1, Ordering::SeqCst);
            if device.identity().uid == "a" {
                Err(DeviceError::ConnectionLost)
            } else {
                Err(DeviceError::Other("flaky".into()))
            }
        });
        // Both errors are non-fatal to the iteration.
        assert_eq!(visited.load(Ordering::SeqCst), 2);
    }
}
