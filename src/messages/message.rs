//! The message value object.

use std::sync::Arc;

/// Arbitrary message payload.
pub type Value = serde_json::Value;

/// An immutable message: the concrete (job, component, name) origin triple
/// plus a payload.
///
/// Messages are created by [`MessageBus::send`](crate::MessageBus::send),
/// never mutated, and discarded after delivery. The fields are `Arc<str>` so
/// cloning per matched listener stays cheap.
#[derive(Clone, Debug)]
pub struct Message {
    job: Arc<str>,
    component: Arc<str>,
    name: Arc<str>,
    value: Value,
}

impl Message {
    /// Creates a message with the given origin triple and payload.
    pub fn new(
        job: impl Into<Arc<str>>,
        component: impl Into<Arc<str>>,
        name: impl Into<Arc<str>>,
        value: Value,
    ) -> Self {
        Self {
            job: job.into(),
            component: component.into(),
            name: name.into(),
            value,
        }
    }

    /// Name of the job the sending component belongs to.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Name of the sending component.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Event name of the message.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The payload.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Copy of this message with the payload replaced (used by slot
    /// transforms; the origin triple is shared, not cloned).
    pub fn with_value(&self, value: Value) -> Self {
        Self {
            job: Arc::clone(&self.job),
            component: Arc::clone(&self.component),
            name: Arc::clone(&self.name),
            value,
        }
    }
}
