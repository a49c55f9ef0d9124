//! Runtime configuration.
//!
//! [`Config`] carries the connection endpoint for the peripheral link and the
//! five independent tracing toggles. Tracing output goes through the
//! `tracing` facade with one target per subsystem (`core`, `devices`, `bus`,
//! `job`, `component`); the toggles gate whether a subsystem emits at all.
//!
//! # Example
//! ```
//! use switchboard::Config;
//!
//! let mut cfg = Config::default();
//! cfg.host = "brickd.local".into();
//! cfg.event_tracing = true;
//!
//! assert_eq!(cfg.port, 4223);
//! ```

/// Global configuration for a [`Core`](crate::Core).
#[derive(Clone, Debug)]
pub struct Config {
    /// Host of the peripheral connection endpoint.
    pub host: String,
    /// Port of the peripheral connection endpoint.
    pub port: u16,
    /// Trace core lifecycle (start/stop, install/uninstall, activation).
    pub core_tracing: bool,
    /// Trace device binding, hooks, and dispatcher wiring.
    pub device_tracing: bool,
    /// Trace message routing and dropped messages on the bus.
    pub event_tracing: bool,
    /// Trace job activation and component management (per-job default).
    pub job_tracing: bool,
    /// Trace component enablement and sends (per-component default).
    pub component_tracing: bool,
}

impl Default for Config {
    /// Provides the default configuration:
    /// - `host = "localhost"`, `port = 4223`
    /// - all tracing on except `event_tracing` (routing is noisy)
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4223,
            core_tracing: true,
            device_tracing: true,
            event_tracing: false,
            job_tracing: true,
            component_tracing: true,
        }
    }
}
