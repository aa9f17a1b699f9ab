//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP, SIGQUIT)
//! - Trigger shutdown on the first one received
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Every termination signal triggers the same orchestrated stop

use std::io;

use tokio::signal::unix::{signal, SignalKind};

use crate::lifecycle::shutdown::Shutdown;

/// Wait for a termination signal and return its name.
pub async fn wait_for_signal() -> io::Result<&'static str> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
        _ = hup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

/// Trigger `shutdown` on the first termination signal.
pub async fn shutdown_on_signal(shutdown: Shutdown) -> io::Result<()> {
    tokio::select! {
        received = wait_for_signal() => {
            let name = received?;
            tracing::info!(signal = name, "Signal received, shutting down proxy");
            shutdown.trigger();
        }
        _ = shutdown.triggered() => {}
    }
    Ok(())
}
