//! Fan-out adapter for single-slot device callbacks.

use std::sync::{Arc, Mutex};

use super::connection::DeviceEventCallback;
use crate::lock;
use crate::messages::Value;

/// An ordered list of callbacks behind one callable.
///
/// Peripherals accept exactly one native callback per event code; the
/// manager installs [`as_callback`](Multicast::as_callback) into that slot
/// and lets any number of subscribers join through `add`. Removal is by
/// `Arc` identity. No isolation of its own: a panicking subscriber
/// propagates to the caller.
#[derive(Clone, Default)]
pub struct Multicast {
    callbacks: Arc<Mutex<Vec<DeviceEventCallback>>>,
}

impl Multicast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a callback.
    pub fn add(&self, callback: DeviceEventCallback) {
        lock(&self.callbacks).push(callback);
    }

    /// Removes the first entry that is the same allocation as `callback`.
    pub fn remove(&self, callback: &DeviceEventCallback) {
        let mut callbacks = lock(&self.callbacks);
        if let Some(pos) = callbacks.iter().position(|c| Arc::ptr_eq(c, callback)) {
            callbacks.remove(pos);
        }
    }

    /// True when no subscribers remain.
    pub fn is_empty(&self) -> bool {
        lock(&self.callbacks).is_empty()
    }

    /// Invokes every registered callback in insertion order.
    pub fn invoke(&self, value: &Value) {
        // Snapshot so a callback may add or remove subscribers.
        let callbacks = lock(&self.callbacks).clone();
        for callback in callbacks {
            callback(value);
        }
    }

    /// The single closure handed to a peripheral's native callback slot.
    pub fn as_callback(&self) -> DeviceEventCallback {
        let this = self.clone();
        Arc::new(move |value| this.invoke(value))
    }
}
