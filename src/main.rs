//! anc-daemon: control-plane daemon for Active Noise Cancellation
//!
//! Runs the ANC state machine over a single inbound event stream:
//! - Unix-socket control protocol for user commands and status
//! - Signal engine boundary for the DSP side (loopback on the host)
//! - Session persistence across power cycles
//!
//! Hardware event sources (wear detection, wind/quiet detectors, the peer
//! link) post into the same event channel the IPC server feeds.

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use anc_daemon::config::{AncProfile, Config};
use anc_daemon::events::{Event, Notification};
use anc_daemon::ipc::Server;
use anc_daemon::lifecycle::ShutdownSignal;
use anc_daemon::peer::{PeerLink, Role};
use anc_daemon::signal::LoopbackEngine;
use anc_daemon::state::StateMachine;
use anc_daemon::storage::JsonSessionStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "anc-daemon starting");

    // Load configuration and the product tuning profile
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, "configuration loaded");

    let profile = AncProfile::load_or_default(&config.profile_path)?;

    // Create shutdown signal handler
    let shutdown = ShutdownSignal::new();

    // Channels: one inbound event stream into the state machine, one
    // broadcast stream of notifications out of it.
    let (event_tx, event_rx) = mpsc::channel::<Event>(32);
    let (notify_tx, _notify_rx) = broadcast::channel::<Notification>(64);

    // The loopback engine posts completions back into the event channel.
    let engine = LoopbackEngine::new(event_tx.clone());
    let store = JsonSessionStore::new(config.session_path.clone());
    let peer = PeerLink::new(Role::Primary);

    let num_modes = profile.num_modes();
    let mut machine = StateMachine::new(
        profile,
        engine,
        Box::new(store),
        peer,
        notify_tx.clone(),
        event_tx.clone(),
    );
    machine.initialise()?;

    // Create IPC server; commands it accepts are queued as events.
    let server = Server::new(&config.socket_path, event_tx.clone(), notify_tx.clone(), num_modes)?;

    // Bring the device up.
    event_tx.send(Event::PowerOn).await?;

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        // Run the state machine (processes all inbound events)
        _ = machine.run(event_rx) => {
            info!("state machine exited");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Wait for shutdown signal
        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup: power the machine off so the session block is persisted.
    info!("shutting down...");

    machine.step(Event::PowerOff);
    server.shutdown().await;

    info!("anc-daemon stopped");

    Ok(())
}
