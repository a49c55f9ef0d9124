//! The peripheral lifecycle manager.
//!
//! [`DeviceManager`] bridges the reconnecting external connection to a
//! stable internal registry:
//!
//! ```text
//! Connection (broadcast events) ──► listener task ──► bind / unbind
//!                                                        │
//!                           initializers / finalizers ◄──┤
//!                           per-(uid, event) Multicast ◄─┤
//!                           DeviceHandle notifications ◄─┘
//! ```
//!
//! Peripherals come and go at any time; the manager keeps the registry, the
//! per-peripheral dispatcher tables, and every registered [`DeviceHandle`]
//! consistent across those transitions. All registry mutation happens on the
//! listener task (or inline in `add_handle`/`remove_handle`/`stop`, which
//! the embedding application calls single-threaded).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::connection::{
    ConnectionEvent, ConnectionRef, ConnectionState, DeviceEventCallback, DeviceIdentity,
    DeviceRef, DeviceType, EnumerationKind, EventCode,
};
use super::handle::DeviceHandle;
use super::multicast::Multicast;
use crate::error::DeviceError;
use crate::lock;

/// Hook run against a peripheral when it binds (initializer) or is about to
/// unbind on shutdown (finalizer).
pub type DeviceHook = Arc<dyn Fn(&DeviceRef) -> Result<(), DeviceError> + Send + Sync>;

/// Owns the connection, the peripheral registry, and the handle set.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct DeviceManager {
    shared: Arc<ManagerShared>,
}

pub(super) struct ManagerShared {
    connection: ConnectionRef,
    host: String,
    port: u16,
    devices: Mutex<HashMap<String, DeviceRef>>,
    handles: Mutex<Vec<DeviceHandle>>,
    initializers: Mutex<HashMap<DeviceType, Vec<DeviceHook>>>,
    finalizers: Mutex<HashMap<DeviceType, Vec<DeviceHook>>>,
    // Lazily created per (uid, event code); survives unbind/rebind cycles
    // only when subscribers remain registered through a handle.
    callbacks: Mutex<HashMap<String, HashMap<EventCode, Multicast>>>,
    connected: AtomicBool,
    tracing: AtomicBool,
    listener: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DeviceManager {
    /// Creates a manager over an external connection. The connection is put
    /// into auto-reconnect mode; the manager rebinds peripherals as they
    /// re-enumerate after a reconnect.
    pub fn new(connection: ConnectionRef, host: impl Into<String>, port: u16) -> Self {
        connection.set_auto_reconnect(true);
        Self {
            shared: Arc::new(ManagerShared {
                connection,
                host: host.into(),
                port,
                devices: Mutex::new(HashMap::new()),
                handles: Mutex::new(Vec::new()),
                initializers: Mutex::new(HashMap::new()),
                finalizers: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
                tracing: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn set_tracing(&self, enabled: bool) {
        self.shared.tracing.store(enabled, Ordering::Relaxed);
    }

    fn tracing(&self) -> bool {
        self.shared.tracing.load(Ordering::Relaxed)
    }

    /// True while the external connection reports itself up.
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// The currently bound peripheral for a UID, if present.
    pub fn device(&self, uid: &str) -> Option<DeviceRef> {
        lock(&self.shared.devices).get(uid).cloned()
    }

    /// Registers a hook run when a peripheral of the given type binds.
    pub fn add_initializer(
        &self,
        device_type: DeviceType,
        hook: impl Fn(&DeviceRef) -> Result<(), DeviceError> + Send + Sync + 'static,
    ) {
        lock(&self.shared.initializers)
            .entry(device_type)
            .or_default()
            .push(Arc::new(hook));
    }

    /// Registers a hook run against bound peripherals of the given type on
    /// manager shutdown.
    pub fn add_finalizer(
        &self,
        device_type: DeviceType,
        hook: impl Fn(&DeviceRef) -> Result<(), DeviceError> + Send + Sync + 'static,
    ) {
        lock(&self.shared.finalizers)
            .entry(device_type)
            .or_default()
            .push(Arc::new(hook));
    }

    /// Connects (if disconnected) and spawns the event listener task.
    /// A no-op when already started.
    pub async fn start(&self) -> Result<(), DeviceError> {
        if lock(&self.shared.listener).is_some() {
            debug!(target: "device", "already started");
            return Ok(());
        }
        // Subscribe before connecting so the connect event is not missed.
        let mut rx = self.shared.connection.subscribe();
        if self.shared.connection.state() == ConnectionState::Disconnected {
            self.shared
                .connection
                .connect(&self.shared.host, self.shared.port)
                .await?;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let me = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => me.handle_event(event).await,
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(target: "device", skipped, "connection event stream lagged");
                            continue;
                        }
                    }
                }
            }
        });
        *lock(&self.shared.listener) = Some((token, task));
        Ok(())
    }

    /// Finalizes and unbinds every peripheral, disconnects, and stops the
    /// listener task. A no-op when never started.
    pub async fn stop(&self) {
        let listener = lock(&self.shared.listener).take();
        let Some((token, task)) = listener else {
            debug!(target: "device", "already stopped");
            return;
        };
        token.cancel();
        if task.await.is_err() {
            error!(target: "device", "event listener panicked");
        }

        let uids: Vec<String> = lock(&self.shared.devices).keys().cloned().collect();
        for uid in uids {
            let Some(device) = lock(&self.shared.devices).remove(&uid) else {
                continue;
            };
            let hooks = self.hooks_for(&self.shared.finalizers, device.identity().device_type);
            run_hooks(&hooks, &device, "finalizer");
            self.withdraw(&device);
        }

        if self.shared.connection.state() != ConnectionState::Disconnected {
            if let Err(err) = self.shared.connection.disconnect().await {
                warn!(target: "device", error = %err, "disconnect failed");
            }
        }
        self.shared.connected.store(false, Ordering::Relaxed);
    }

    /// Registers a handle and replays a bind for every present peripheral.
    pub fn add_handle(&self, handle: DeviceHandle) {
        handle.on_attach(self);
        lock(&self.shared.handles).push(handle.clone());
        for device in self.bound_devices() {
            handle.on_bind_device(self, &device);
        }
    }

    /// Replays an unbind for every present peripheral, then unregisters the
    /// handle (matched by identity).
    pub fn remove_handle(&self, handle: &DeviceHandle) {
        for device in self.bound_devices() {
            handle.on_unbind_device(self, &device);
        }
        lock(&self.shared.handles).retain(|h| h != handle);
        handle.on_detach();
    }

    /// Subscribes a callback to one hardware event of one peripheral. The
    /// per-(uid, event) dispatcher is created on first use and installed
    /// into the peripheral's native callback slot.
    pub fn add_device_callback(&self, uid: &str, event: EventCode, callback: DeviceEventCallback) {
        let (multicast, fresh) = {
            let mut callbacks = lock(&self.shared.callbacks);
            let table = callbacks.entry(uid.to_string()).or_default();
            match table.get(&event) {
                Some(multicast) => (multicast.clone(), false),
                None => {
                    let multicast = Multicast::new();
                    table.insert(event, multicast.clone());
                    (multicast, true)
                }
            }
        };
        if fresh {
            if let Some(device) = self.device(uid) {
                device.register_callback(event, Some(multicast.as_callback()));
            }
        }
        multicast.add(callback);
    }

    /// Removes a previously added callback; dropping the last subscriber
    /// clears the peripheral's native slot.
    pub fn remove_device_callback(&self, uid: &str, event: EventCode, callback: &DeviceEventCallback) {
        let emptied = {
            let mut callbacks = lock(&self.shared.callbacks);
            let Some(table) = callbacks.get_mut(uid) else {
                return;
            };
            let Some(multicast) = table.get(&event) else {
                return;
            };
            multicast.remove(callback);
            if multicast.is_empty() {
                table.remove(&event);
                if table.is_empty() {
                    callbacks.remove(uid);
                }
                true
            } else {
                false
            }
        };
        if emptied {
            if let Some(device) = self.device(uid) {
                device.register_callback(event, None);
            }
        }
    }

    async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Enumerate { identity, kind } => match kind {
                EnumerationKind::Available | EnumerationKind::Connected => {
                    self.bind_device(identity);
                }
                EnumerationKind::Disconnected => self.unbind_device(&identity.uid),
            },
            ConnectionEvent::Connected { reason } => {
                self.shared.connected.store(true, Ordering::Relaxed);
                if self.tracing() {
                    debug!(target: "device", ?reason, "connection up");
                }
                if let Err(err) = self.shared.connection.enumerate().await {
                    warn!(target: "device", error = %err, "enumeration request failed");
                }
            }
            ConnectionEvent::Disconnected { reason } => {
                self.shared.connected.store(false, Ordering::Relaxed);
                if self.tracing() {
                    debug!(target: "device", ?reason, "connection down");
                }
            }
        }
    }

    fn bind_device(&self, identity: DeviceIdentity) {
        if lock(&self.shared.devices).contains_key(&identity.uid) {
            if self.tracing() {
                debug!(target: "device", uid = %identity.uid, "already bound");
            }
            return;
        }
        let device = match self
            .shared
            .connection
            .create_device(identity.device_type, &identity.uid)
        {
            Ok(device) => device,
            Err(err) => {
                warn!(
                    target: "device",
                    uid = %identity.uid,
                    device_type = identity.device_type,
                    error = %err,
                    "skipping peripheral"
                );
                return;
            }
        };

        let hooks = self.hooks_for(&self.shared.initializers, identity.device_type);
        run_hooks(&hooks, &device, "initializer");

        lock(&self.shared.devices).insert(identity.uid.clone(), Arc::clone(&device));

        // Dispatchers registered while the peripheral was absent attach now.
        let table = lock(&self.shared.callbacks)
            .get(&identity.uid)
            .map(|t| t.iter().map(|(e, m)| (*e, m.clone())).collect::<Vec<_>>());
        if let Some(table) = table {
            for (event, multicast) in table {
                device.register_callback(event, Some(multicast.as_callback()));
            }
        }

        if self.tracing() {
            debug!(target: "device", uid = %identity.uid, device_type = identity.device_type, "bound");
        }
        // Snapshot before notifying: callbacks may re-enter the manager.
        let handles = lock(&self.shared.handles).clone();
        for handle in handles {
            handle.on_bind_device(self, &device);
        }
    }

    fn unbind_device(&self, uid: &str) {
        let Some(device) = lock(&self.shared.devices).remove(uid) else {
            return;
        };
        if self.tracing() {
            debug!(target: "device", uid, "unbound");
        }
        self.withdraw(&device);
    }

    /// Unbind notifications plus dispatcher-table teardown for a peripheral
    /// already removed from the registry.
    fn withdraw(&self, device: &DeviceRef) {
        let handles = lock(&self.shared.handles).clone();
        for handle in handles {
            handle.on_unbind_device(self, device);
        }
        lock(&self.shared.callbacks).remove(&device.identity().uid);
    }

    fn bound_devices(&self) -> Vec<DeviceRef> {
        lock(&self.shared.devices).values().cloned().collect()
    }

    fn hooks_for(
        &self,
        table: &Mutex<HashMap<DeviceType, Vec<DeviceHook>>>,
        device_type: DeviceType,
    ) -> Vec<DeviceHook> {
        lock(table).get(&device_type).cloned().unwrap_or_default()
    }

    pub(super) fn downgrade(&self) -> Weak<ManagerShared> {
        Arc::downgrade(&self.shared)
    }

    pub(super) fn upgrade(weak: &Weak<ManagerShared>) -> Option<DeviceManager> {
        weak.upgrade().map(|shared| DeviceManager { shared })
    }
}

/// `ConnectionLost` is the expected teardown race and stays silent; any
/// other hook failure is logged and never aborts the loop.
fn run_hooks(hooks: &[DeviceHook], device: &DeviceRef, stage: &str) {
    for hook in hooks {
        match hook(device) {
            Ok(()) => {}
            Err(err) if err.is_connection_lost() => {}
            Err(err) => warn!(
                target: "device",
                uid = %device.identity().uid,
                stage,
                error = %err,
                "hook failed"
            ),
        }
    }
}
