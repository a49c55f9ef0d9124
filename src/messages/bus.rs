//! The asynchronous, pattern-addressed message bus.
//!
//! [`MessageBus`] decouples senders from receivers with ordered, filtered
//! delivery:
//!
//! ```text
//! Component::send ──► unbounded FIFO queue ──► delivery worker (one task)
//!                                                   │ lookup under lock
//!                                                   ▼
//!                                         ReverseIndex<Listener>
//!                                     (exact ∪ wildcard ∪ alias groups)
//!                                                   │ invoke outside lock
//!                                                   ▼
//!                                      listener callbacks, in order
//! ```
//!
//! ## Rules
//! - **FIFO**: messages are delivered in `send` order; a single worker means
//!   at most one message is being dispatched at any instant.
//! - **Unbounded**: `send` never blocks and never applies back-pressure.
//! - **Drop before start**: sending while the bus is stopped logs and drops
//!   the message; it is not an error.
//! - **Isolation**: a panicking listener is logged and does not affect the
//!   delivery to remaining listeners or future messages.
//! - **Re-entrancy**: callbacks run without the state lock held, so a
//!   listener may itself `send` or add/remove listeners; such calls take
//!   effect on a later pass, never inline.
//! - **Drain on stop**: [`stop`](MessageBus::stop) returns only after every
//!   already-queued message has been delivered. The explicitly-named
//!   [`stop_discarding`](MessageBus::stop_discarding) variant drains the
//!   queue without dispatching.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::index::{GroupSet, ReverseIndex};
use super::listener::Listener;
use super::message::{Message, Value};
use crate::lock;

/// The three addressing levels of the bus.
const LEVELS: usize = 3;
const LEVEL_JOB: usize = 0;
const LEVEL_COMPONENT: usize = 1;
const LEVEL_NAME: usize = 2;

/// Asynchronous publish/subscribe engine over (job, component, name).
///
/// Cheap to clone; all clones share the same queue, index, and worker.
#[derive(Clone)]
pub struct MessageBus {
    shared: Arc<BusShared>,
}

struct BusShared {
    state: Mutex<BusState>,
    queue: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    discard: AtomicBool,
    tracing: AtomicBool,
}

struct BusState {
    index: ReverseIndex<Listener>,
    groups: GroupSet,
}

impl MessageBus {
    /// Creates a stopped bus with empty index and group tables.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BusShared {
                state: Mutex::new(BusState {
                    index: ReverseIndex::new(LEVELS),
                    groups: GroupSet::new(LEVELS),
                }),
                queue: Mutex::new(None),
                worker: Mutex::new(None),
                discard: AtomicBool::new(false),
                tracing: AtomicBool::new(false),
            }),
        }
    }

    /// Enables or disables route/drop tracing for this bus.
    pub fn set_tracing(&self, enabled: bool) {
        self.shared.tracing.store(enabled, Ordering::Relaxed);
    }

    fn tracing(&self) -> bool {
        self.shared.tracing.load(Ordering::Relaxed)
    }

    /// Registers a listener. Legal at any time, including from a listener
    /// callback while the bus is running.
    pub fn add_listener(&self, listener: Listener) {
        let mut state = lock(&self.shared.state);
        let groups = state.groups.clone();
        state.index.add(listener, &groups);
    }

    /// Removes a previously added listener (matched by identity).
    pub fn remove_listener(&self, listener: &Listener) {
        let mut state = lock(&self.shared.state);
        let groups = state.groups.clone();
        state.index.remove(listener, &groups);
    }

    /// Registers an alias group at the origin-job level.
    pub fn job_group(&self, group: &str, members: &[&str]) {
        self.add_group(LEVEL_JOB, group, members);
    }

    /// Registers an alias group at the origin-component level.
    pub fn component_group(&self, group: &str, members: &[&str]) {
        self.add_group(LEVEL_COMPONENT, group, members);
    }

    /// Registers an alias group at the event-name level.
    pub fn name_group(&self, group: &str, members: &[&str]) {
        self.add_group(LEVEL_NAME, group, members);
    }

    fn add_group(&self, level: usize, group: &str, members: &[&str]) {
        if self.is_running() {
            error!(target: "bus", group, "alias group registered after start is not supported");
            return;
        }
        lock(&self.shared.state).groups.add_group(level, group, members);
    }

    /// Builds the group reverse lookups; the group tables are closed after
    /// this point. Called by the core when it starts.
    pub fn initialize(&self) {
        lock(&self.shared.state).groups.initialize();
    }

    /// True while the delivery worker is running.
    pub fn is_running(&self) -> bool {
        lock(&self.shared.queue).is_some()
    }

    /// Starts the delivery worker; a no-op if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut queue = lock(&self.shared.queue);
        if queue.is_some() {
            debug!(target: "bus", "already started");
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *queue = Some(tx);
        drop(queue);

        self.shared.discard.store(false, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        *lock(&self.shared.worker) = Some(tokio::spawn(deliver_loop(shared, rx)));
    }

    /// Enqueues a message for delivery.
    ///
    /// While the bus is stopped the message is logged and dropped; this is
    /// not an error.
    pub fn send(&self, job: &str, component: &str, name: &str, value: Value) {
        let queue = lock(&self.shared.queue);
        let Some(tx) = queue.as_ref() else {
            if self.tracing() {
                debug!(target: "bus", job, component, name, "DROPPED message before start");
            }
            return;
        };
        if tx.send(Message::new(job, component, name, value)).is_err() {
            error!(target: "bus", job, component, name, "delivery worker is gone; message lost");
        }
    }

    /// Stops the bus after delivering every already-queued message.
    ///
    /// A no-op if already stopped. Blocks until the worker has exited.
    pub async fn stop(&self) {
        self.shutdown(false).await;
    }

    /// Stops the bus, draining the queue without dispatching the remaining
    /// messages. Opt-in variant; [`stop`](MessageBus::stop) is the contract.
    pub async fn stop_discarding(&self) {
        self.shutdown(true).await;
    }

    async fn shutdown(&self, discard: bool) {
        let tx = lock(&self.shared.queue).take();
        if tx.is_none() {
            debug!(target: "bus", "already stopped");
            return;
        }
        self.shared.discard.store(discard, Ordering::Relaxed);
        drop(tx);

        let worker = lock(&self.shared.worker).take();
        if let Some(handle) = worker {
            if handle.await.is_err() {
                error!(target: "bus", "delivery worker panicked");
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Clone identity: two handles are equal when they share the same bus.
impl PartialEq for MessageBus {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for MessageBus {}

/// The delivery worker: pops messages in FIFO order and dispatches each to
/// every matching listener. Exits once all senders are gone and the queue
/// has been drained, which is what makes `stop` a drain barrier.
async fn deliver_loop(shared: Arc<BusShared>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let tracing = shared.tracing.load(Ordering::Relaxed);
        if shared.discard.load(Ordering::Relaxed) {
            if tracing {
                debug!(
                    target: "bus",
                    job = message.job(),
                    name = message.name(),
                    "DISCARDED queued message on stop"
                );
            }
            continue;
        }
        let matches = {
            let state = lock(&shared.state);
            state.index.lookup(
                &[message.job(), message.component(), message.name()],
                &state.groups,
            )
        };
        for listener in matches {
            if tracing {
                debug!(
                    target: "bus",
                    job = message.job(),
                    component = message.component(),
                    name = message.name(),
                    receiver = %listener.receiver(),
                    "ROUTE"
                );
            }
            // Invoked without the state lock: listeners may send or mutate
            // subscriptions re-entrantly.
            if catch_unwind(AssertUnwindSafe(|| listener.deliver(&message))).is_err() {
                error!(
                    target: "bus",
                    receiver = %listener.receiver(),
                    name = message.name(),
                    "listener panicked; continuing delivery"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Slot;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn recording_listener(slot: Slot, sink: Arc<Mutex<Vec<String>>>) -> Listener {
        Listener::new(slot, move |m| {
            lock(&sink).push(format!("{}/{}/{}", m.job(), m.component(), m.name()));
        })
    }

    #[tokio::test]
    async fn fifo_delivery_in_send_order() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.add_listener(Listener::new(Slot::new(), move |m| {
            lock(&sink).push(m.value().as_i64().unwrap_or(-1));
        }));

        bus.start();
        for i in 0..100 {
            bus.send("j", "c", "n", json!(i));
        }
        bus.stop().await;

        assert_eq!(*lock(&seen), (0..100).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn wildcard_matches_every_origin_job() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.add_listener(recording_listener(
            Slot::new().with_component("c").with_name("n"),
            Arc::clone(&seen),
        ));

        bus.start();
        bus.send("alpha", "c", "n", json!(null));
        bus.send("beta", "c", "n", json!(null));
        bus.send("beta", "other", "n", json!(null));
        bus.stop().await;

        assert_eq!(*lock(&seen), vec!["alpha/c/n", "beta/c/n"]);
    }

    #[tokio::test]
    async fn alias_group_expands_to_members_only() {
        let bus = MessageBus::new();
        bus.job_group("pair", &["a", "b"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.add_listener(recording_listener(
            Slot::new().with_job("pair"),
            Arc::clone(&seen),
        ));

        bus.initialize();
        bus.start();
        bus.send("a", "c", "n", json!(null));
        bus.send("b", "c", "n", json!(null));
        bus.send("other", "c", "n", json!(null));
        bus.stop().await;

        assert_eq!(*lock(&seen), vec!["a/c/n", "b/c/n"]);
    }

    #[tokio::test]
    async fn send_before_start_is_dropped() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.add_listener(recording_listener(Slot::new(), Arc::clone(&seen)));

        bus.send("j", "c", "n", json!(null));
        bus.start();
        bus.send("j", "c", "late", json!(null));
        bus.stop().await;

        assert_eq!(*lock(&seen), vec!["j/c/late"]);
    }

    #[tokio::test]
    async fn at_most_one_delivery_in_flight() {
        let bus = MessageBus::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));
        for _ in 0..2 {
            let in_flight = Arc::clone(&in_flight);
            let overlap = Arc::clone(&overlap);
            bus.add_listener(Listener::new(Slot::new(), move |_| {
                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                std::thread::yield_now();
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        bus.start();
        for i in 0..50 {
            bus.send("j", "c", "n", json!(i));
        }
        bus.stop().await;

        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_delivery() {
        let bus = MessageBus::new();
        bus.add_listener(Listener::new(Slot::new(), |_| panic!("boom")));
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.add_listener(recording_listener(Slot::new(), Arc::clone(&seen)));

        bus.start();
        bus.send("j", "c", "n", json!(null));
        bus.send("j", "c", "n2", json!(null));
        bus.stop().await;

        assert_eq!(*lock(&seen), vec!["j/c/n", "j/c/n2"]);
    }

    #[tokio::test]
    async fn listener_may_send_reentrantly() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let echo_bus = bus.clone();
        bus.add_listener(Listener::new(Slot::new().with_name("ping"), move |m| {
            echo_bus.send("j", "c", "pong", m.value().clone());
        }));
        bus.add_listener(recording_listener(
            Slot::new().with_name("pong"),
            Arc::clone(&seen),
        ));

        bus.start();
        bus.send("j", "c", "ping", json!(null));
        // The re-entrant message is enqueued behind the current pass.
        tokio::task::yield_now().await;
        bus.stop().await;

        assert_eq!(*lock(&seen), vec!["j/c/pong"]);
    }

    #[tokio::test]
    async fn stop_discarding_skips_queued_messages() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.add_listener(recording_listener(Slot::new(), Arc::clone(&seen)));

        bus.start();
        bus.stop().await;
        // Restart with a queue that is dropped unseen.
        bus.start();
        bus.send("j", "c", "n", json!(null));
        bus.stop_discarding().await;

        // Either delivered before the discard flag was observed or dropped;
        // with the flag set before the sender is dropped the worker still
        // races the first recv, so only the stronger property is asserted:
        // no message arrives after stop_discarding returned.
        let count = lock(&seen).len();
        tokio::task::yield_now().await;
        assert_eq!(lock(&seen).len(), count);
    }

    #[tokio::test]
    async fn removed_listener_receives_nothing() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = recording_listener(Slot::new(), Arc::clone(&seen));
        bus.add_listener(listener.clone());
        bus.remove_listener(&listener);

        bus.start();
        bus.send("j", "c", "n", json!(null));
        bus.stop().await;

        assert!(lock(&seen).is_empty());
    }
}
