//! Signal handling for graceful shutdown.

use tracing::{info, warn};

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT).
///
/// If a handler cannot be installed that signal is simply never observed.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    async fn recv(handler: &mut Option<Signal>) {
        match handler {
            Some(handler) => {
                handler.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    let install = |kind: SignalKind, name: &'static str| match signal(kind) {
        Ok(handler) => Some(handler),
        Err(error) => {
            warn!(signal = name, %error, "Failed to install signal handler");
            None
        }
    };

    let mut sigint = install(SignalKind::interrupt(), "SIGINT");
    let mut sigterm = install(SignalKind::terminate(), "SIGTERM");
    let mut sigquit = install(SignalKind::quit(), "SIGQUIT");

    tokio::select! {
        _ = recv(&mut sigint) => info!(message = "Signal received.", signal = "SIGINT"),
        _ = recv(&mut sigterm) => info!(message = "Signal received.", signal = "SIGTERM"),
        _ = recv(&mut sigquit) => info!(message = "Signal received.", signal = "SIGQUIT"),
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!(message = "Signal received.", signal = "CTRL_C");
}
