//! Subscription patterns.
//!
//! A [`Slot`] describes which messages a listener is interested in: one
//! optional match value per addressing level (job, component, name), an
//! optional predicate over the full message, and an optional payload
//! transform applied before delivery. Slots are immutable after
//! construction; the `with_*` builders consume and return the slot.

use std::fmt;
use std::sync::Arc;

use super::message::{Message, Value};

/// Predicate over a matched message; a `false` result skips delivery.
pub type Predicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Payload transform applied before the callback sees the message.
pub type Transform = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// An immutable subscription pattern.
///
/// Each match field is either a concrete name, `None` for "match anything at
/// this level", or the name of an alias group registered with the bus.
///
/// # Example
/// ```
/// use switchboard::Slot;
///
/// let slot = Slot::new()
///     .with_job("clock")
///     .with_name("tick")
///     .with_predicate(|msg| msg.value().is_number());
/// assert_eq!(slot.job(), Some("clock"));
/// assert_eq!(slot.component(), None);
/// ```
#[derive(Clone, Default)]
pub struct Slot {
    job: Option<String>,
    component: Option<String>,
    name: Option<String>,
    predicate: Option<Predicate>,
    transform: Option<Transform>,
}

impl Slot {
    /// Creates a slot matching every message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the slot to messages from the given origin job (or alias
    /// group at the job level).
    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }

    /// Restricts the slot to messages from the given origin component (or
    /// alias group at the component level).
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Restricts the slot to messages with the given event name (or alias
    /// group at the name level).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attaches a predicate consulted after pattern matching.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Attaches a payload transform applied before delivery.
    pub fn with_transform(
        mut self,
        transform: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// The job match value, if any.
    pub fn job(&self) -> Option<&str> {
        self.job.as_deref()
    }

    /// The component match value, if any.
    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    /// The event-name match value, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Applies the predicate; slots without one accept every message.
    pub(crate) fn accepts(&self, message: &Message) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(message),
            None => true,
        }
    }

    /// Applies the transform to the payload, if one is set.
    pub(crate) fn transform(&self, message: &Message) -> Option<Message> {
        self.transform
            .as_ref()
            .map(|t| message.with_value(t(message.value())))
    }
}

/// Equality compares the three match fields only; predicate and transform
/// are function values without meaningful equality.
impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.job == other.job && self.component == other.component && self.name == other.name
    }
}

impl Eq for Slot {}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("job", &self.job)
            .field("component", &self.component)
            .field("name", &self.name)
            .field("predicate", &self.predicate.is_some())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn predicate_gates_acceptance() {
        let slot = Slot::new().with_predicate(|m| m.value().as_i64() == Some(1));
        assert!(slot.accepts(&Message::new("j", "c", "n", json!(1))));
        assert!(!slot.accepts(&Message::new("j", "c", "n", json!(2))));
    }

    #[test]
    fn transform_rewrites_payload_only() {
        let slot = Slot::new().with_transform(|v| json!(v.as_i64().unwrap_or(0) * 2));
        let msg = Message::new("j", "c", "n", json!(21));
        let out = slot.transform(&msg).unwrap();
        assert_eq!(out.value(), &json!(42));
        assert_eq!(out.job(), "j");
    }

    #[test]
    fn equality_ignores_function_fields() {
        let a = Slot::new().with_job("j").with_predicate(|_| true);
        let b = Slot::new().with_job("j");
        assert_eq!(a, b);
        assert_ne!(a, Slot::new().with_job("k"));
    }
}
