//! Components: the reusable building blocks of a job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use super::job::{Job, JobInner};
use crate::devices::DeviceHandle;
use crate::error::RuntimeError;
use crate::lock;
use crate::messages::{Listener, Value};

/// Override points for component lifecycle transitions. Every method
/// defaults to a no-op; implement only what the component reacts to.
pub trait ComponentHook: Send + Sync {
    fn on_enabled(&self, _component: &Component) {}
    fn on_disabled(&self, _component: &Component) {}
    fn on_core_started(&self, _component: &Component) {}
    fn on_core_stopped(&self, _component: &Component) {}
    fn on_job_activated(&self, _component: &Component) {}
    fn on_job_deactivated(&self, _component: &Component) {}
}

/// A named building block owned by exactly one [`Job`].
///
/// A component declares bus listeners and device handles; while the
/// component is enabled they are attached to the owning core's bus and
/// device manager, and detached again when it is disabled. Enablement
/// follows the job's activation in lockstep.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Component {
    inner: Arc<ComponentInner>,
}

struct ComponentInner {
    name: String,
    job: Mutex<Weak<JobInner>>,
    enabled: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
    handles: Mutex<Vec<DeviceHandle>>,
    hook: Mutex<Option<Arc<dyn ComponentHook>>>,
    // Tri-state tracing override: None inherits from the job / the config.
    tracing: Mutex<Option<bool>>,
}

impl Component {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ComponentInner {
                name: name.into(),
                job: Mutex::new(Weak::new()),
                enabled: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
                handles: Mutex::new(Vec::new()),
                hook: Mutex::new(None),
                tracing: Mutex::new(None),
            }),
        }
    }

    /// Installs the lifecycle hook.
    pub fn with_hook(self, hook: impl ComponentHook + 'static) -> Self {
        *lock(&self.inner.hook) = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// The owning job, while attached.
    pub fn job(&self) -> Option<Job> {
        Job::upgrade(&lock(&self.inner.job))
    }

    /// Overrides the component tracing toggle; `None` inherits.
    pub fn set_tracing(&self, enabled: Option<bool>) {
        *lock(&self.inner.tracing) = enabled;
    }

    /// Declares a bus subscription. While the component is enabled the
    /// listener is registered with the bus immediately.
    pub fn add_listener(&self, listener: Listener) {
        listener.set_receiver(self.receiver_label());
        if self.enabled() {
            if let Some(core) = self.job().and_then(|job| job.core()) {
                core.bus().add_listener(listener.clone());
            }
        }
        lock(&self.inner.listeners).push(listener);
    }

    /// Declares interest in peripherals. While the component is enabled the
    /// handle is registered with the device manager immediately.
    pub fn add_device_handle(&self, handle: DeviceHandle) {
        if self.enabled() {
            if let Some(core) = self.job().and_then(|job| job.core()) {
                core.device_manager().add_handle(handle.clone());
            }
        }
        lock(&self.inner.handles).push(handle);
    }

    /// The declared device handles (bound or not).
    pub fn device_handles(&self) -> Vec<DeviceHandle> {
        lock(&self.inner.handles).clone()
    }

    /// Enables or disables the component.
    ///
    /// Requires an owning job; enabling additionally requires that job to be
    /// active. Setting the current value is a no-op. Enabling attaches
    /// listeners and device handles, then runs `on_enabled`; disabling runs
    /// `on_disabled`, then detaches.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), RuntimeError> {
        let job = self
            .job()
            .ok_or_else(|| RuntimeError::ComponentNotAttached(self.inner.name.clone()))?;
        if self.enabled() == enabled {
            if self.tracing_enabled(&job) {
                debug!(target: "component", component = %self.receiver_label(), enabled, "state unchanged");
            }
            return Ok(());
        }
        if enabled && !job.active() {
            return Err(RuntimeError::JobNotActive {
                job: job.name().to_string(),
                component: self.inner.name.clone(),
            });
        }
        let core = job
            .core()
            .ok_or_else(|| RuntimeError::JobNotInstalled(job.name().to_string()))?;

        if enabled {
            // Snapshots: bus and manager calls must not run under our locks.
            let listeners = lock(&self.inner.listeners).clone();
            for listener in listeners {
                core.bus().add_listener(listener);
            }
            let handles = lock(&self.inner.handles).clone();
            for handle in handles {
                core.device_manager().add_handle(handle);
            }
            self.inner.enabled.store(true, Ordering::Relaxed);
            if self.tracing_enabled(&job) {
                debug!(target: "component", component = %self.receiver_label(), "enabled");
            }
            if let Some(hook) = self.hook() {
                hook.on_enabled(self);
            }
        } else {
            if let Some(hook) = self.hook() {
                hook.on_disabled(self);
            }
            self.inner.enabled.store(false, Ordering::Relaxed);
            let listeners = lock(&self.inner.listeners).clone();
            for listener in listeners {
                core.bus().remove_listener(&listener);
            }
            let handles = lock(&self.inner.handles).clone();
            for handle in handles {
                core.device_manager().remove_handle(&handle);
            }
            if self.tracing_enabled(&job) {
                debug!(target: "component", component = %self.receiver_label(), "disabled");
            }
        }
        Ok(())
    }

    /// Publishes a message under the owning job's and this component's name.
    /// Requires the component to be enabled.
    pub fn send(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        let job = self
            .job()
            .ok_or_else(|| RuntimeError::ComponentNotAttached(self.inner.name.clone()))?;
        if !self.enabled() {
            return Err(RuntimeError::ComponentNotEnabled(self.inner.name.clone()));
        }
        let core = job
            .core()
            .ok_or_else(|| RuntimeError::JobNotInstalled(job.name().to_string()))?;
        if core.config().event_tracing {
            debug!(
                target: "event",
                job = job.name(),
                component = %self.inner.name,
                name,
                value = %value,
                "EVENT"
            );
        }
        core.bus().send(job.name(), &self.inner.name, name, value);
        Ok(())
    }

    fn receiver_label(&self) -> String {
        match self.job() {
            Some(job) => format!("{}.{}", job.name(), self.inner.name),
            None => self.inner.name.clone(),
        }
    }

    fn hook(&self) -> Option<Arc<dyn ComponentHook>> {
        lock(&self.inner.hook).clone()
    }

    fn tracing_enabled(&self, job: &Job) -> bool {
        if let Some(enabled) = *lock(&self.inner.tracing) {
            return enabled;
        }
        if let Some(enabled) = job.tracing_override() {
            return enabled;
        }
        job.core().map(|core| core.config().component_tracing).unwrap_or(false)
    }

    pub(super) fn attach_job(&self, job: &Job) -> Result<(), RuntimeError> {
        let mut slot = lock(&self.inner.job);
        if slot.upgrade().is_some() {
            return Err(RuntimeError::ComponentAlreadyAttached(
                self.inner.name.clone(),
            ));
        }
        *slot = job.downgrade();
        Ok(())
    }

    pub(super) fn detach_job(&self) {
        *lock(&self.inner.job) = Weak::new();
    }

    pub(super) fn notify_core_started(&self) {
        if let Some(hook) = self.hook() {
            hook.on_core_started(self);
        }
    }

    pub(super) fn notify_core_stopped(&self) {
        if let Some(hook) = self.hook() {
            hook.on_core_stopped(self);
        }
    }

    pub(super) fn notify_job_activated(&self) {
        if let Some(hook) = self.hook() {
            hook.on_job_activated(self);
        }
    }

    pub(super) fn notify_job_deactivated(&self) {
        if let Some(hook) = self.hook() {
            hook.on_job_deactivated(self);
        }
    }
}

/// Identity equality, like jobs and listeners.
impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Component {}
