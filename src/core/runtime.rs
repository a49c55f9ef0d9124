//! The core orchestrator.
//!
//! [`Core`] ties the message bus, the device manager, and the job registry
//! together:
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │             Core             │
//!                 │  registry · current · history │
//!                 └────┬───────────────────┬─────┘
//!                      ▼                   ▼
//!                 MessageBus         DeviceManager
//!                      ▲                   ▲
//!            Job ──► Component ────────────┘
//! ```
//!
//! Orchestration calls (`install`, `activate`, `set_enabled`, …) are made
//! single-threaded by the embedding application; only the bus worker and the
//! connection listener run concurrently with them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::job::Job;
use super::shutdown::wait_for_shutdown_signal;
use crate::config::Config;
use crate::devices::{ConnectionRef, DeviceManager};
use crate::error::RuntimeError;
use crate::lock;
use crate::messages::MessageBus;

/// Owns one bus, one device manager, the job registry, and the foreground
/// application state.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Core {
    shared: Arc<CoreShared>,
}

pub(super) struct CoreShared {
    config: Config,
    bus: MessageBus,
    manager: DeviceManager,
    started: AtomicBool,
    jobs: Mutex<Vec<Job>>,
    default_app: Mutex<Option<Job>>,
    current: Mutex<Option<Job>>,
    history: Mutex<Vec<Job>>,
    stop_token: Mutex<CancellationToken>,
}

impl Core {
    /// Creates a core over an external peripheral connection.
    pub fn new(config: Config, connection: ConnectionRef) -> Self {
        let bus = MessageBus::new();
        bus.set_tracing(config.event_tracing);
        let manager = DeviceManager::new(connection, config.host.clone(), config.port);
        manager.set_tracing(config.device_tracing);
        Self {
            shared: Arc::new(CoreShared {
                config,
                bus,
                manager,
                started: AtomicBool::new(false),
                jobs: Mutex::new(Vec::new()),
                default_app: Mutex::new(None),
                current: Mutex::new(None),
                history: Mutex::new(Vec::new()),
                stop_token: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.shared.bus
    }

    pub fn device_manager(&self) -> &DeviceManager {
        &self.shared.manager
    }

    pub fn started(&self) -> bool {
        self.shared.started.load(Ordering::Relaxed)
    }

    /// The installed job with the given name.
    pub fn job(&self, name: &str) -> Option<Job> {
        lock(&self.shared.jobs)
            .iter()
            .find(|job| job.name() == name)
            .cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        lock(&self.shared.jobs).clone()
    }

    /// The current foreground application, if any.
    pub fn current_app(&self) -> Option<Job> {
        lock(&self.shared.current).clone()
    }

    /// Designates the application activated on start and used as the history
    /// fallback. Must be installed before `start`.
    pub fn set_default_app(&self, app: &Job) -> Result<(), RuntimeError> {
        if !app.is_app() {
            return Err(RuntimeError::NotAnApp(app.name().to_string()));
        }
        *lock(&self.shared.default_app) = Some(app.clone());
        Ok(())
    }

    /// Installs a job. A name collision uninstalls the existing job first
    /// (replace semantics); a job already bound to a core is a usage error.
    /// On a started core, background jobs are activated immediately.
    pub fn install(&self, job: Job) -> Result<(), RuntimeError> {
        if job.core().is_some() {
            return Err(RuntimeError::JobAlreadyInstalled(job.name().to_string()));
        }
        if let Some(existing) = self.job(job.name()) {
            self.uninstall(&existing)?;
        }
        job.attach_core(self)?;
        lock(&self.shared.jobs).push(job.clone());
        if self.tracing() {
            debug!(target: "core", job = job.name(), "installed");
        }
        if self.started() && job.is_background() {
            job.set_active(true)?;
        }
        Ok(())
    }

    /// Uninstalls a job (matched by identity), forcing deactivation and
    /// purging it from the foreground state and the history stack.
    pub fn uninstall(&self, job: &Job) -> Result<(), RuntimeError> {
        if !lock(&self.shared.jobs).iter().any(|j| j == job) {
            return Err(RuntimeError::UnknownJob(job.name().to_string()));
        }
        if job.active() {
            job.set_active(false)?;
        }
        {
            let mut current = lock(&self.shared.current);
            if current.as_ref() == Some(job) {
                *current = None;
            }
        }
        lock(&self.shared.history).retain(|j| j != job);
        {
            let mut default_app = lock(&self.shared.default_app);
            if default_app.as_ref() == Some(job) {
                *default_app = None;
            }
        }
        job.detach_core(self);
        lock(&self.shared.jobs).retain(|j| j != job);
        if self.tracing() {
            debug!(target: "core", job = job.name(), "uninstalled");
        }
        Ok(())
    }

    /// Starts the runtime: bus first, then the device manager, then job
    /// activation (services, then the default application). Idempotent.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        if self.started() {
            debug!(target: "core", "already started");
            return Ok(());
        }
        if self.tracing() {
            debug!(target: "core", "starting");
        }
        {
            let mut token = lock(&self.shared.stop_token);
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        self.shared.bus.initialize();
        self.shared.bus.start();
        self.shared.manager.start().await?;
        self.shared.started.store(true, Ordering::Relaxed);

        for job in self.jobs() {
            job.notify_core_started();
        }
        for job in self.jobs() {
            if job.is_background() && !job.active() {
                job.set_active(true)?;
            }
        }
        let default_app = lock(&self.shared.default_app).clone();
        if let Some(app) = default_app {
            self.switch_to(&app, false)?;
        }
        Ok(())
    }

    /// Stops the runtime: deactivates every active job, stops the device
    /// manager, and drains and stops the bus. Idempotent. Releases
    /// [`wait_for_stop`](Core::wait_for_stop).
    pub async fn stop(&self) {
        if !self.started() {
            debug!(target: "core", "already stopped");
            return;
        }
        if self.tracing() {
            debug!(target: "core", "stopping");
        }
        for job in self.jobs() {
            if job.active() {
                if let Err(err) = job.set_active(false) {
                    error!(target: "core", job = job.name(), error = %err, "deactivation on stop failed");
                }
            }
        }
        *lock(&self.shared.current) = None;
        lock(&self.shared.history).clear();
        self.shared.started.store(false, Ordering::Relaxed);
        for job in self.jobs() {
            job.notify_core_stopped();
        }
        self.shared.manager.stop().await;
        self.shared.bus.stop().await;
        lock(&self.shared.stop_token).clone().cancel();
    }

    /// Blocks until `stop()` completes, or a termination signal arrives, in
    /// which case the core stops itself first.
    pub async fn wait_for_stop(&self) {
        let token = lock(&self.shared.stop_token).clone();
        tokio::select! {
            _ = token.cancelled() => {}
            result = wait_for_shutdown_signal() => {
                if let Err(err) = result {
                    error!(target: "core", error = %err, "signal listener failed");
                }
                self.stop().await;
            }
        }
    }

    /// Brings an application to the foreground. The previously current
    /// application is deactivated and, when history-eligible, pushed onto
    /// the history stack. Activating the current application is a no-op.
    pub fn activate(&self, app: &Job) -> Result<(), RuntimeError> {
        self.check_app(app)?;
        self.switch_to(app, true)
    }

    /// [`activate`](Core::activate) by registry name.
    pub fn activate_named(&self, name: &str) -> Result<(), RuntimeError> {
        let app = self
            .job(name)
            .ok_or_else(|| RuntimeError::UnknownJob(name.to_string()))?;
        self.activate(&app)
    }

    /// Sends an application to the background, resolving its replacement
    /// through the history stack: the most recent entry distinct from the
    /// departing application, falling back to the default application. The
    /// replacement is activated without a history push.
    pub fn deactivate(&self, app: &Job) -> Result<(), RuntimeError> {
        self.check_app(app)?;
        let next = {
            let mut history = lock(&self.shared.history);
            let mut next = history.pop();
            if next.as_ref() == Some(app) {
                next = history.pop();
            }
            next
        };
        let next = next.or_else(|| lock(&self.shared.default_app).clone());
        match next {
            Some(next) => self.switch_to(&next, false),
            None => {
                // Nothing to fall back to; the foreground becomes empty.
                if app.active() {
                    app.set_active(false)?;
                }
                let mut current = lock(&self.shared.current);
                if current.as_ref() == Some(app) {
                    *current = None;
                }
                Ok(())
            }
        }
    }

    fn switch_to(&self, app: &Job, push_history: bool) -> Result<(), RuntimeError> {
        let previous = lock(&self.shared.current).clone();
        if previous.as_ref() == Some(app) {
            if self.tracing() {
                debug!(target: "core", app = app.name(), "already in foreground");
            }
            return Ok(());
        }
        if let Some(previous) = &previous {
            previous.set_active(false)?;
        }
        app.set_active(true)?;
        *lock(&self.shared.current) = Some(app.clone());
        if push_history {
            if let Some(previous) = previous {
                if previous.in_history() {
                    lock(&self.shared.history).push(previous);
                }
            }
        }
        if self.tracing() {
            debug!(target: "core", app = app.name(), "foreground application");
        }
        Ok(())
    }

    fn check_app(&self, app: &Job) -> Result<(), RuntimeError> {
        if !app.is_app() {
            return Err(RuntimeError::NotAnApp(app.name().to_string()));
        }
        if !lock(&self.shared.jobs).iter().any(|j| j == app) {
            return Err(RuntimeError::UnknownJob(app.name().to_string()));
        }
        Ok(())
    }

    fn tracing(&self) -> bool {
        self.shared.config.core_tracing
    }

    pub(super) fn downgrade(&self) -> Weak<CoreShared> {
        Arc::downgrade(&self.shared)
    }

    pub(super) fn upgrade(weak: &Weak<CoreShared>) -> Option<Core> {
        weak.upgrade().map(|shared| Core { shared })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::component::{Component, ComponentHook};
    use crate::devices::testing::{settle, FakeConnection};
    use crate::error::RuntimeError;
    use crate::messages::{Listener, Slot};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn quiet_config() -> Config {
        Config {
            core_tracing: false,
            device_tracing: false,
            job_tracing: false,
            component_tracing: false,
            ..Config::default()
        }
    }

    fn core() -> Core {
        Core::new(quiet_config(), FakeConnection::new())
    }

    struct CountingHook {
        enabled: Arc<AtomicUsize>,
        disabled: Arc<AtomicUsize>,
    }

    impl ComponentHook for CountingHook {
        fn on_enabled(&self, _component: &Component) {
            self.enabled.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disabled(&self, _component: &Component) {
            self.disabled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_component(name: &str) -> (Component, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let enabled = Arc::new(AtomicUsize::new(0));
        let disabled = Arc::new(AtomicUsize::new(0));
        let component = Component::new(name).with_hook(CountingHook {
            enabled: Arc::clone(&enabled),
            disabled: Arc::clone(&disabled),
        });
        (component, enabled, disabled)
    }

    #[tokio::test]
    async fn enabling_under_an_inactive_job_is_a_usage_error() {
        let core = core();
        let job = Job::app("menu");
        let component = Component::new("display");
        job.add_component(component.clone()).unwrap();
        core.install(job).unwrap();
        core.start().await.unwrap();

        let err = component.set_enabled(true).unwrap_err();
        assert!(matches!(err, RuntimeError::JobNotActive { .. }));
        assert!(!component.enabled());
        core.stop().await;
    }

    #[tokio::test]
    async fn activation_cascades_into_each_component_exactly_once() {
        let core = core();
        let job = Job::app("menu");
        let (first, first_enabled, first_disabled) = counting_component("display");
        let (second, second_enabled, second_disabled) = counting_component("buttons");
        job.add_component(first).unwrap();
        job.add_component(second).unwrap();
        core.install(job.clone()).unwrap();
        core.start().await.unwrap();

        job.set_active(true).unwrap();
        assert_eq!(first_enabled.load(Ordering::SeqCst), 1);
        assert_eq!(second_enabled.load(Ordering::SeqCst), 1);

        job.set_active(false).unwrap();
        assert_eq!(first_disabled.load(Ordering::SeqCst), 1);
        assert_eq!(second_disabled.load(Ordering::SeqCst), 1);
        core.stop().await;
    }

    struct PeerObserver {
        peer: Component,
        peer_enabled_at_notice: Arc<AtomicBool>,
    }

    impl ComponentHook for PeerObserver {
        fn on_job_activated(&self, _component: &Component) {
            self.peer_enabled_at_notice
                .store(self.peer.enabled(), Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn activation_notice_follows_enablement_of_every_component() {
        let core = core();
        let job = Job::app("menu");
        let buttons = Component::new("buttons");
        let observed = Arc::new(AtomicBool::new(false));
        let display = Component::new("display").with_hook(PeerObserver {
            peer: buttons.clone(),
            peer_enabled_at_notice: Arc::clone(&observed),
        });
        job.add_component(display).unwrap();
        job.add_component(buttons).unwrap();
        core.install(job.clone()).unwrap();
        core.start().await.unwrap();

        job.set_active(true).unwrap();
        // "display" is notified first; "buttons" must already be enabled.
        assert!(observed.load(Ordering::SeqCst));
        core.stop().await;
    }

    #[tokio::test]
    async fn services_activate_on_start_and_on_late_install() {
        let core = core();
        let early = Job::service("clock");
        core.install(early.clone()).unwrap();
        assert!(!early.active());

        core.start().await.unwrap();
        assert!(early.active());

        let late = Job::service("watchdog");
        core.install(late.clone()).unwrap();
        assert!(late.active());
        core.stop().await;
        assert!(!early.active());
        assert!(!late.active());
    }

    #[tokio::test]
    async fn activation_requires_install_and_a_started_core() {
        let core = core();
        let job = Job::app("menu");
        assert!(matches!(
            job.set_active(true).unwrap_err(),
            RuntimeError::JobNotInstalled(_)
        ));

        core.install(job.clone()).unwrap();
        assert!(matches!(
            job.set_active(true).unwrap_err(),
            RuntimeError::CoreNotStarted(_)
        ));
    }

    #[tokio::test]
    async fn install_replaces_by_name_and_rejects_double_install() {
        let core = core();
        let old = Job::app("menu");
        let new = Job::app("menu");
        core.install(old.clone()).unwrap();
        core.install(new.clone()).unwrap();

        assert!(old.core().is_none());
        assert_eq!(core.jobs().len(), 1);
        assert!(core.job("menu").unwrap() == new);

        assert!(matches!(
            core.install(new).unwrap_err(),
            RuntimeError::JobAlreadyInstalled(_)
        ));
        let other = Core::new(quiet_config(), FakeConnection::new());
        let taken = Job::app("other");
        core.install(taken.clone()).unwrap();
        assert!(matches!(
            other.install(taken).unwrap_err(),
            RuntimeError::JobAlreadyInstalled(_)
        ));
    }

    #[tokio::test]
    async fn uninstall_forces_deactivation_and_purges_history() {
        let core = core();
        let default = Job::app("home");
        let visitor = Job::app("settings");
        core.install(default.clone()).unwrap();
        core.install(visitor.clone()).unwrap();
        core.set_default_app(&default).unwrap();
        core.start().await.unwrap();

        core.activate(&visitor).unwrap();
        assert!(visitor.active());

        core.uninstall(&visitor).unwrap();
        assert!(!visitor.active());
        assert!(visitor.core().is_none());
        assert!(core.current_app().is_none());

        assert!(matches!(
            core.uninstall(&visitor).unwrap_err(),
            RuntimeError::UnknownJob(_)
        ));
        core.stop().await;
    }

    #[tokio::test]
    async fn history_round_trip_resolves_back_to_the_default() {
        let core = core();
        let default = Job::app("home");
        let first = Job::app("settings");
        let second = Job::app("editor");
        core.install(default.clone()).unwrap();
        core.install(first.clone()).unwrap();
        core.install(second.clone()).unwrap();
        core.set_default_app(&default).unwrap();
        core.start().await.unwrap();
        assert!(core.current_app().unwrap() == default);

        core.activate(&first).unwrap();
        core.activate(&second).unwrap();
        assert!(core.current_app().unwrap() == second);

        core.deactivate(&second).unwrap();
        assert!(core.current_app().unwrap() == first);

        core.deactivate(&first).unwrap();
        assert!(core.current_app().unwrap() == default);
        assert!(default.active());
        assert!(!first.active());
        core.stop().await;
    }

    #[tokio::test]
    async fn history_skips_ineligible_applications() {
        let core = core();
        let default = Job::app("home");
        let transient = Job::app("splash");
        transient.set_in_history(false).unwrap();
        let target = Job::app("editor");
        core.install(default.clone()).unwrap();
        core.install(transient.clone()).unwrap();
        core.install(target.clone()).unwrap();
        core.set_default_app(&default).unwrap();
        core.start().await.unwrap();

        core.activate(&transient).unwrap();
        core.activate(&target).unwrap();
        // The transient app never entered the stack.
        core.deactivate(&target).unwrap();
        assert!(core.current_app().unwrap() == default);
        core.stop().await;
    }

    #[tokio::test]
    async fn activate_rejects_services_and_unknown_names() {
        let core = core();
        let service = Job::service("clock");
        core.install(service.clone()).unwrap();
        core.start().await.unwrap();

        assert!(matches!(
            core.activate(&service).unwrap_err(),
            RuntimeError::NotAnApp(_)
        ));
        assert!(matches!(
            core.activate_named("missing").unwrap_err(),
            RuntimeError::UnknownJob(_)
        ));
        core.stop().await;
    }

    #[tokio::test]
    async fn a_message_can_bring_an_application_to_the_foreground() {
        let core = core();
        let default = Job::app("home");
        let menu = Job::app("menu");
        menu.add_activator(Slot::new().with_name("open-menu")).unwrap();
        menu.add_deactivator(Slot::new().with_name("close-menu")).unwrap();
        core.install(default.clone()).unwrap();
        core.install(menu.clone()).unwrap();
        core.set_default_app(&default).unwrap();
        core.start().await.unwrap();

        core.bus().send("remote", "button", "open-menu", json!(null));
        settle().await;
        assert!(core.current_app().unwrap() == menu);

        core.bus().send("remote", "button", "close-menu", json!(null));
        settle().await;
        assert!(core.current_app().unwrap() == default);
        core.stop().await;
    }

    #[tokio::test]
    async fn components_send_through_the_bus_end_to_end() {
        let core = core();
        let clock = Job::service("clock");
        let ticker = Component::new("ticker");
        clock.add_component(ticker.clone()).unwrap();

        let menu = Job::app("menu");
        let display = Component::new("display");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        display.add_listener(Listener::new(
            Slot::new().with_job("clock").with_name("tick"),
            move |msg| lock(&sink).push(msg.value().clone()),
        ));
        menu.add_component(display.clone()).unwrap();

        core.install(clock).unwrap();
        core.install(menu.clone()).unwrap();
        core.set_default_app(&menu).unwrap();

        // Disabled components must not publish.
        assert!(matches!(
            ticker.send("tick", json!(0)).unwrap_err(),
            RuntimeError::ComponentNotEnabled(_)
        ));

        core.start().await.unwrap();
        ticker.send("tick", json!(1)).unwrap();
        ticker.send("tick", json!(2)).unwrap();
        settle().await;
        assert_eq!(*lock(&seen), vec![json!(1), json!(2)]);

        // Deactivation detaches the listener again.
        menu.set_active(false).unwrap();
        ticker.send("tick", json!(3)).unwrap();
        settle().await;
        assert_eq!(lock(&seen).len(), 2);
        core.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_wait_for_stop() {
        let core = core();
        core.start().await.unwrap();

        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.wait_for_stop().await })
        };
        settle().await;
        core.stop().await;
        waiter.await.unwrap();
        assert!(!core.started());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let core = core();
        core.start().await.unwrap();
        core.start().await.unwrap();
        assert!(core.started());
        core.stop().await;
        core.stop().await;
        assert!(!core.started());
    }
}
