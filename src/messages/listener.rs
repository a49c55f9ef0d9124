//! Listeners: slots bound to callbacks.
//!
//! A [`Listener`] is a [`Slot`] bound to a callback plus a receiver label
//! used for route tracing. Listener identity is the allocation, not the
//! pattern: removing a listener from a bus requires the exact instance that
//! was added, and two listeners with identical slots are distinct.
//!
//! A [`MultiListener`] bundles several slots behind one shared callback and
//! keeps them attached to (or detached from) buses as a unit; applications
//! use it for their activator and deactivator triggers.

use std::fmt;
use std::sync::{Arc, Mutex};

use super::bus::MessageBus;
use super::index::KeyedPattern;
use super::message::Message;
use super::slot::Slot;
use crate::lock;

/// Callback invoked with each delivered message.
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// A subscription: slot, callback, and a human-readable receiver label.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    slot: Slot,
    callback: MessageCallback,
    receiver: Mutex<String>,
}

impl Listener {
    /// Creates a listener from a slot and a callback.
    pub fn new(slot: Slot, callback: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        Self::from_callback(slot, Arc::new(callback))
    }

    pub(crate) fn from_callback(slot: Slot, callback: MessageCallback) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                slot,
                callback,
                receiver: Mutex::new(String::new()),
            }),
        }
    }

    /// The subscription pattern.
    pub fn slot(&self) -> &Slot {
        &self.inner.slot
    }

    /// The receiver label used in route traces.
    pub fn receiver(&self) -> String {
        lock(&self.inner.receiver).clone()
    }

    /// Sets the receiver label (done by the component or bundle that owns
    /// the listener).
    pub fn set_receiver(&self, label: impl Into<String>) {
        *lock(&self.inner.receiver) = label.into();
    }

    /// Applies predicate and transform, then invokes the callback.
    pub(crate) fn deliver(&self, message: &Message) {
        if !self.inner.slot.accepts(message) {
            return;
        }
        match self.inner.slot.transform(message) {
            Some(transformed) => (self.inner.callback)(&transformed),
            None => (self.inner.callback)(message),
        }
    }
}

/// Identity equality: removal requires the exact instance that was added.
impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Listener {}

impl KeyedPattern for Listener {
    fn key_at(&self, level: usize) -> Option<&str> {
        match level {
            0 => self.inner.slot.job(),
            1 => self.inner.slot.component(),
            _ => self.inner.slot.name(),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("slot", &self.inner.slot)
            .field("receiver", &self.receiver())
            .finish()
    }
}

/// A named bundle of slots sharing one callback.
///
/// The bundle tracks which buses it is attached to; adding or removing a
/// slot keeps every attached bus in sync, and `attach`/`detach` move all
/// slots at once.
#[derive(Clone)]
pub struct MultiListener {
    inner: Arc<MultiListenerInner>,
}

struct MultiListenerInner {
    name: String,
    callback: MessageCallback,
    slots: Mutex<Vec<(Slot, Listener)>>,
    buses: Mutex<Vec<MessageBus>>,
}

impl MultiListener {
    /// Creates an empty bundle with the given name and shared callback.
    pub fn new(name: impl Into<String>, callback: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        Self::from_callback(name, Arc::new(callback))
    }

    pub(crate) fn from_callback(name: impl Into<String>, callback: MessageCallback) -> Self {
        Self {
            inner: Arc::new(MultiListenerInner {
                name: name.into(),
                callback,
                slots: Mutex::new(Vec::new()),
                buses: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The bundle name (also the receiver label of its listeners).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Adds a slot; a listener for it is registered with every attached bus.
    pub fn add_slot(&self, slot: Slot) {
        let listener = Listener::from_callback(slot.clone(), Arc::clone(&self.inner.callback));
        listener.set_receiver(self.inner.name.clone());
        for bus in lock(&self.inner.buses).iter() {
            bus.add_listener(listener.clone());
        }
        lock(&self.inner.slots).push((slot, listener));
    }

    /// Removes the first slot with the same match pattern, detaching its
    /// listener from every attached bus.
    pub fn remove_slot(&self, slot: &Slot) {
        let removed = {
            let mut slots = lock(&self.inner.slots);
            slots
                .iter()
                .position(|(s, _)| s == slot)
                .map(|pos| slots.remove(pos))
        };
        if let Some((_, listener)) = removed {
            for bus in lock(&self.inner.buses).iter() {
                bus.remove_listener(&listener);
            }
        }
    }

    /// Attaches every slot to the given bus; attaching twice is a no-op.
    pub fn attach(&self, bus: &MessageBus) {
        {
            let mut buses = lock(&self.inner.buses);
            if buses.iter().any(|b| b == bus) {
                return;
            }
            buses.push(bus.clone());
        }
        for (_, listener) in lock(&self.inner.slots).iter() {
            bus.add_listener(listener.clone());
        }
    }

    /// Detaches every slot from the given bus.
    pub fn detach(&self, bus: &MessageBus) {
        {
            let mut buses = lock(&self.inner.buses);
            let Some(pos) = buses.iter().position(|b| b == bus) else {
                return;
            };
            buses.remove(pos);
        }
        for (_, listener) in lock(&self.inner.slots).iter() {
            bus.remove_listener(listener);
        }
    }
}

impl fmt::Debug for MultiListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiListener")
            .field("name", &self.inner.name)
            .field("slots", &lock(&self.inner.slots).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn identity_not_pattern_equality() {
        let a = Listener::new(Slot::new().with_name("x"), |_| {});
        let b = Listener::new(Slot::new().with_name("x"), |_| {});
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn deliver_respects_predicate_and_transform() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = Listener::new(
            Slot::new()
                .with_predicate(|m| m.value().as_i64().unwrap_or(0) > 0)
                .with_transform(|v| json!(v.as_i64().unwrap_or(0) + 1)),
            move |m| lock(&sink).push(m.value().clone()),
        );

        listener.deliver(&Message::new("j", "c", "n", json!(-1)));
        listener.deliver(&Message::new("j", "c", "n", json!(41)));
        assert_eq!(*lock(&seen), vec![json!(42)]);
    }

    #[test]
    fn multi_listener_shares_one_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let bundle = MultiListener::new("triggers", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bundle.add_slot(Slot::new().with_name("a"));
        bundle.add_slot(Slot::new().with_name("b"));

        let slots = lock(&bundle.inner.slots);
        for (_, listener) in slots.iter() {
            listener.deliver(&Message::new("j", "c", "a", json!(null)));
        }
        // Both listeners saw the message; only the "a" slot had a matching
        // name but deliver() does not pattern-match (the index does).
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
