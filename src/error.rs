//! Error types used by the switchboard runtime.
//!
//! This module defines two error enums with strictly separated roles:
//!
//! - [`RuntimeError`] — usage/contract violations raised by the orchestration
//!   surface (activating an uninstalled job, enabling a component whose job
//!   is inactive, sending from a disabled component, …). These always surface
//!   to the caller and are never swallowed by the runtime.
//! - [`DeviceError`] — failures of peripheral I/O during initializer,
//!   finalizer, and device-handle calls. [`DeviceError::ConnectionLost`] is
//!   the distinguished code that hook error handling suppresses silently
//!   (expected during teardown races); every other variant is logged and the
//!   surrounding loop continues.
//!
//! Both types provide `as_label` helpers for stable log identifiers.

use thiserror::Error;

/// Usage and contract violations of the orchestration API.
///
/// These are programmer errors; the runtime never retries or swallows them.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The job must be installed in a core for this operation.
    #[error("job '{0}' is not installed in any core")]
    JobNotInstalled(String),

    /// A job may be installed in at most one core at a time.
    #[error("job '{0}' is already installed in a core")]
    JobAlreadyInstalled(String),

    /// No job with the given name is installed in this core.
    #[error("job '{0}' is not installed in this core")]
    UnknownJob(String),

    /// A job can only be activated while its core is started.
    #[error("job '{0}' can not be activated while the core is stopped")]
    CoreNotStarted(String),

    /// The component must belong to a job for this operation.
    #[error("component '{0}' is not attached to any job")]
    ComponentNotAttached(String),

    /// A component may belong to at most one job at a time.
    #[error("component '{0}' is already attached to a job")]
    ComponentAlreadyAttached(String),

    /// No component with the given name belongs to this job.
    #[error("component '{0}' is not attached to this job")]
    UnknownComponent(String),

    /// A component can only be enabled while its job is active.
    #[error("component '{component}' can not be enabled while job '{job}' is inactive")]
    JobNotActive {
        /// The owning job.
        job: String,
        /// The component that was to be enabled.
        component: String,
    },

    /// Sending requires an enabled component.
    #[error("component '{0}' is not enabled")]
    ComponentNotEnabled(String),

    /// The operation is only available on applications, not services.
    #[error("job '{0}' is not an application")]
    NotAnApp(String),

    /// A peripheral failure surfaced through the orchestration API
    /// (connecting on core start, for example).
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::JobNotInstalled(_) => "job_not_installed",
            RuntimeError::JobAlreadyInstalled(_) => "job_already_installed",
            RuntimeError::UnknownJob(_) => "unknown_job",
            RuntimeError::CoreNotStarted(_) => "core_not_started",
            RuntimeError::ComponentNotAttached(_) => "component_not_attached",
            RuntimeError::ComponentAlreadyAttached(_) => "component_already_attached",
            RuntimeError::UnknownComponent(_) => "unknown_component",
            RuntimeError::JobNotActive { .. } => "job_not_active",
            RuntimeError::ComponentNotEnabled(_) => "component_not_enabled",
            RuntimeError::NotAnApp(_) => "not_an_app",
            RuntimeError::Device(err) => err.as_label(),
        }
    }
}

/// Failures of the peripheral connection and of device operations.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The connection to the peripheral endpoint was lost.
    ///
    /// Suppressed without logging inside initializer/finalizer/handle loops;
    /// losing the connection mid-hook is an expected teardown race.
    #[error("connection lost")]
    ConnectionLost,

    /// The connection is not established.
    #[error("not connected")]
    NotConnected,

    /// The connection endpoint rejected or failed the connect attempt.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// No typed binding is available for the given peripheral type.
    #[error("unknown device type {0}")]
    UnknownDeviceType(u16),

    /// A device operation failed for any other reason.
    #[error("device error: {0}")]
    Other(String),
}

impl DeviceError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            DeviceError::ConnectionLost => "connection_lost",
            DeviceError::NotConnected => "not_connected",
            DeviceError::ConnectFailed(_) => "connect_failed",
            DeviceError::UnknownDeviceType(_) => "unknown_device_type",
            DeviceError::Other(_) => "device_error",
        }
    }

    /// True for the distinguished lost-connection code that hook error
    /// handling suppresses.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DeviceError::ConnectionLost)
    }
}
