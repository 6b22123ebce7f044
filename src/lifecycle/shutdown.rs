//! Signal handling for daemon shutdown
//!
//! A caught SIGTERM or SIGINT resolves the daemon's main select loop, which
//! then feeds a power-off through the state machine so the ANC session block
//! is persisted before the process exits.

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Waits for the signals that end an anc-daemon run.
pub struct ShutdownSignal;

impl ShutdownSignal {
    pub fn new() -> Self {
        Self
    }

    /// Resolve on the first of SIGTERM or SIGINT.
    pub async fn wait(&self) {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received, powering ANC off"),
            _ = sigint.recv() => info!("SIGINT received, powering ANC off"),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
