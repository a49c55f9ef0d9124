//! Jobs: independently activatable units of the application.
//!
//! A [`Job`] is either a *service* (background, activated automatically when
//! the core starts) or an *application* (foreground, at most one active at a
//! time, switched through [`Core::activate`](super::Core::activate) and the
//! history stack). Applications additionally carry activator and deactivator
//! trigger bundles that stay attached to the bus for the whole installed
//! lifetime, so an inactive application can be brought to the foreground by
//! a message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use super::component::Component;
use super::runtime::{Core, CoreShared};
use crate::error::RuntimeError;
use crate::lock;
use crate::messages::{Listener, MultiListener, Slot};

/// Override points for job lifecycle transitions; all default to no-ops.
pub trait JobHook: Send + Sync {
    fn on_activated(&self, _job: &Job) {}
    fn on_deactivated(&self, _job: &Job) {}
    fn on_core_started(&self, _job: &Job) {}
    fn on_core_stopped(&self, _job: &Job) {}
}

/// A named, independently activatable unit.
///
/// Cheap to clone; clones share state. Equality is identity.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

pub(super) struct JobInner {
    name: String,
    background: bool,
    core: Mutex<Weak<CoreShared>>,
    active: AtomicBool,
    components: Mutex<Vec<Component>>,
    listeners: Mutex<Vec<Listener>>,
    hook: Mutex<Option<Arc<dyn JobHook>>>,
    tracing: Mutex<Option<bool>>,
    // Present only for applications.
    app: Option<AppState>,
}

struct AppState {
    in_history: AtomicBool,
    activators: MultiListener,
    deactivators: MultiListener,
}

impl Job {
    /// Creates a background job, activated automatically on core start.
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(JobInner {
                name: name.into(),
                background: true,
                core: Mutex::new(Weak::new()),
                active: AtomicBool::new(false),
                components: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                hook: Mutex::new(None),
                tracing: Mutex::new(None),
                app: None,
            }),
        }
    }

    /// Creates a foreground application, history-eligible by default.
    pub fn app(name: impl Into<String>) -> Self {
        let name = name.into();
        let inner = Arc::new_cyclic(|weak: &Weak<JobInner>| {
            // Triggers hold a weak self-reference: a dropped job cannot be
            // revived by a stale bus message.
            let activators = {
                let weak = weak.clone();
                MultiListener::new(format!("{name}.activate"), move |_| {
                    let Some(job) = Job::upgrade(&weak) else { return };
                    let Some(core) = job.core() else { return };
                    if let Err(err) = core.activate(&job) {
                        warn!(target: "job", job = job.name(), error = %err, "activation trigger failed");
                    }
                })
            };
            let deactivators = {
                let weak = weak.clone();
                MultiListener::new(format!("{name}.deactivate"), move |_| {
                    let Some(job) = Job::upgrade(&weak) else { return };
                    let Some(core) = job.core() else { return };
                    if let Err(err) = core.deactivate(&job) {
                        warn!(target: "job", job = job.name(), error = %err, "deactivation trigger failed");
                    }
                })
            };
            JobInner {
                name,
                background: false,
                core: Mutex::new(Weak::new()),
                active: AtomicBool::new(false),
                components: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                hook: Mutex::new(None),
                tracing: Mutex::new(None),
                app: Some(AppState {
                    in_history: AtomicBool::new(true),
                    activators,
                    deactivators,
                }),
            }
        });
        Job { inner }
    }

    /// Installs the lifecycle hook.
    pub fn with_hook(self, hook: impl JobHook + 'static) -> Self {
        *lock(&self.inner.hook) = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True for services, false for applications.
    pub fn is_background(&self) -> bool {
        self.inner.background
    }

    pub fn is_app(&self) -> bool {
        self.inner.app.is_some()
    }

    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// The owning core, while installed.
    pub fn core(&self) -> Option<Core> {
        Core::upgrade(&lock(&self.inner.core))
    }

    /// Overrides the job tracing toggle; `None` inherits from the config.
    pub fn set_tracing(&self, enabled: Option<bool>) {
        *lock(&self.inner.tracing) = enabled;
    }

    /// Whether deactivating away from this application records it on the
    /// history stack. Always false for services.
    pub fn in_history(&self) -> bool {
        self.inner
            .app
            .as_ref()
            .map(|app| app.in_history.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Marks the application as history-eligible or not.
    pub fn set_in_history(&self, in_history: bool) -> Result<(), RuntimeError> {
        self.app_state()?
            .in_history
            .store(in_history, Ordering::Relaxed);
        Ok(())
    }

    /// Adds a bus pattern whose messages bring this application to the
    /// foreground. Active for the whole installed lifetime.
    pub fn add_activator(&self, slot: Slot) -> Result<(), RuntimeError> {
        self.app_state()?.activators.add_slot(slot);
        Ok(())
    }

    /// Adds a bus pattern whose messages send this application to the
    /// background (resolving the next one through the history stack).
    pub fn add_deactivator(&self, slot: Slot) -> Result<(), RuntimeError> {
        self.app_state()?.deactivators.add_slot(slot);
        Ok(())
    }

    /// Declares a job-level bus subscription, attached while active.
    pub fn add_listener(&self, listener: Listener) {
        listener.set_receiver(self.inner.name.clone());
        if self.active() {
            if let Some(core) = self.core() {
                core.bus().add_listener(listener.clone());
            }
        }
        lock(&self.inner.listeners).push(listener);
    }

    /// Adds a component, replacing any existing one with the same name.
    /// Auto-enables it when the job is already active.
    pub fn add_component(&self, component: Component) -> Result<(), RuntimeError> {
        if let Some(existing) = self.component(component.name()) {
            self.remove_component(&existing)?;
        }
        component.attach_job(self)?;
        lock(&self.inner.components).push(component.clone());
        if self.active() {
            component.set_enabled(true)?;
        }
        Ok(())
    }

    /// Removes a component (matched by identity), force-disabling it first.
    pub fn remove_component(&self, component: &Component) -> Result<(), RuntimeError> {
        if !lock(&self.inner.components).iter().any(|c| c == component) {
            return Err(RuntimeError::UnknownComponent(
                component.name().to_string(),
            ));
        }
        if component.enabled() {
            component.set_enabled(false)?;
        }
        lock(&self.inner.components).retain(|c| c != component);
        component.detach_job();
        Ok(())
    }

    /// The component with the given name, if any.
    pub fn component(&self, name: &str) -> Option<Component> {
        lock(&self.inner.components)
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn components(&self) -> Vec<Component> {
        lock(&self.inner.components).clone()
    }

    /// Activates or deactivates the job.
    ///
    /// Requires the job to be installed; activation additionally requires
    /// the core to be started. Setting the current value is a no-op.
    /// Activation attaches the job's own listeners, enables every component,
    /// notifies each of the activation, then runs `on_activated`;
    /// deactivation runs `on_deactivated`, disables and notifies every
    /// component, and detaches.
    pub fn set_active(&self, active: bool) -> Result<(), RuntimeError> {
        let core = self
            .core()
            .ok_or_else(|| RuntimeError::JobNotInstalled(self.inner.name.clone()))?;
        if self.active() == active {
            if self.tracing_enabled() {
                debug!(target: "job", job = %self.inner.name, active, "state unchanged");
            }
            return Ok(());
        }
        if active && !core.started() {
            return Err(RuntimeError::CoreNotStarted(self.inner.name.clone()));
        }

        if active {
            let listeners = lock(&self.inner.listeners).clone();
            for listener in listeners {
                core.bus().add_listener(listener);
            }
            self.inner.active.store(true, Ordering::Relaxed);
            // Two passes: every component is enabled before any of them is
            // told about the activation.
            let components = self.components();
            for component in &components {
                component.set_enabled(true)?;
            }
            for component in &components {
                component.notify_job_activated();
            }
            if let Some(hook) = self.hook() {
                hook.on_activated(self);
            }
            if self.tracing_enabled() {
                debug!(target: "job", job = %self.inner.name, "activated");
            }
        } else {
            if let Some(hook) = self.hook() {
                hook.on_deactivated(self);
            }
            let components = self.components();
            for component in &components {
                if component.enabled() {
                    component.set_enabled(false)?;
                }
            }
            for component in &components {
                component.notify_job_deactivated();
            }
            self.inner.active.store(false, Ordering::Relaxed);
            let listeners = lock(&self.inner.listeners).clone();
            for listener in listeners {
                core.bus().remove_listener(&listener);
            }
            if self.tracing_enabled() {
                debug!(target: "job", job = %self.inner.name, "deactivated");
            }
        }
        Ok(())
    }

    fn app_state(&self) -> Result<&AppState, RuntimeError> {
        self.inner
            .app
            .as_ref()
            .ok_or_else(|| RuntimeError::NotAnApp(self.inner.name.clone()))
    }

    fn hook(&self) -> Option<Arc<dyn JobHook>> {
        lock(&self.inner.hook).clone()
    }

    fn tracing_enabled(&self) -> bool {
        if let Some(enabled) = *lock(&self.inner.tracing) {
            return enabled;
        }
        self.core().map(|core| core.config().job_tracing).unwrap_or(false)
    }

    pub(super) fn tracing_override(&self) -> Option<bool> {
        *lock(&self.inner.tracing)
    }

    pub(super) fn downgrade(&self) -> Weak<JobInner> {
        Arc::downgrade(&self.inner)
    }

    pub(super) fn upgrade(weak: &Weak<JobInner>) -> Option<Job> {
        weak.upgrade().map(|inner| Job { inner })
    }

    /// Binds the job to its core and attaches application triggers for the
    /// installed lifetime (they must fire while the job is inactive).
    pub(super) fn attach_core(&self, core: &Core) -> Result<(), RuntimeError> {
        {
            let mut slot = lock(&self.inner.core);
            if slot.upgrade().is_some() {
                return Err(RuntimeError::JobAlreadyInstalled(self.inner.name.clone()));
            }
            *slot = core.downgrade();
        }
        if let Some(app) = &self.inner.app {
            app.activators.attach(core.bus());
            app.deactivators.attach(core.bus());
        }
        Ok(())
    }

    pub(super) fn detach_core(&self, core: &Core) {
        if let Some(app) = &self.inner.app {
            app.activators.detach(core.bus());
            app.deactivators.detach(core.bus());
        }
        *lock(&self.inner.core) = Weak::new();
    }

    pub(super) fn notify_core_started(&self) {
        if let Some(hook) = self.hook() {
            hook.on_core_started(self);
        }
        for component in self.components() {
            component.notify_core_started();
        }
    }

    pub(super) fn notify_core_stopped(&self) {
        if let Some(hook) = self.hook() {
            hook.on_core_stopped(self);
        }
        for component in self.components() {
            component.notify_core_stopped();
        }
    }
}

/// Identity equality: the history stack and the registry compare instances.
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Job {}
