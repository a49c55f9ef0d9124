//! Cross-platform termination signal handling for
//! [`Core::wait_for_stop`](super::Core::wait_for_stop).
//!
//! On Unix this listens for `SIGINT`, `SIGTERM`, and `SIGQUIT`; elsewhere it
//! falls back to Ctrl-C.

/// Completes when the process receives a termination signal.
///
/// Each call creates independent signal listeners. Returns `Err` only if
/// signal registration fails.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Completes when the process receives Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
