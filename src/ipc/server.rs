//! Unix domain socket server for the control protocol
//!
//! Provides request-response communication and a push stream of state
//! notifications for subscribed clients. Commands are translated into
//! events and queued for the state machine; the server never mutates ANC
//! state itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::events::{Event, Notification};

use super::protocol::{DaemonStatus, Request, Response};

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Commands are forwarded here and picked up by the state machine
    event_tx: mpsc::Sender<Event>,
    /// State notifications, cloned per subscribed client
    notify_tx: broadcast::Sender<Notification>,
}

/// Shared server state
struct ServerState {
    status: DaemonStatus,
    start_time: std::time::Instant,
}

impl Server {
    /// Create a new IPC server bound to `socket_path`.
    pub fn new(
        socket_path: &Path,
        event_tx: mpsc::Sender<Event>,
        notify_tx: broadcast::Sender<Notification>,
        num_modes: u8,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(RwLock::new(ServerState {
            status: DaemonStatus::new(num_modes),
            start_time: std::time::Instant::now(),
        }));

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            state,
            shutdown_tx,
            event_tx,
            notify_tx,
        })
    }

    /// Run the server: maintain the status snapshot from notifications and
    /// accept client connections.
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        // Status maintenance task, driven by the same notification stream
        // the clients subscribe to.
        {
            let state = Arc::clone(&self.state);
            let mut notify_rx = self.notify_tx.subscribe();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = notify_rx.recv() => match result {
                            Ok(notification) => {
                                let mut state = state.write().await;
                                Self::apply_notification(&mut state.status, &notification);
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "status task lagged behind notifications");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let state = Arc::clone(&self.state);
                    let event_tx = self.event_tx.clone();
                    let notify_rx = self.notify_tx.subscribe();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, state, event_tx, notify_rx) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    fn apply_notification(status: &mut DaemonStatus, notification: &Notification) {
        match notification {
            Notification::EnabledChanged { enabled } => status.enabled = *enabled,
            Notification::ModeChanged { mode } => status.mode = *mode,
            Notification::PreviousConfigChanged { config } => status.previous_config = *config,
            Notification::PreviousModeChanged { mode } => status.previous_mode = *mode,
            Notification::LeakthroughGainChanged { gain } => {
                status.leakthrough_gain = Some(*gain)
            }
            Notification::ToggleCycleChanged { slot, config } => {
                if let Some(entry) = status.toggle_cycle.get_mut(*slot as usize) {
                    *entry = *config;
                }
            }
            Notification::ScenarioConfigChanged { scenario, config } => {
                status.scenario_table.set(*scenario, *config)
            }
            Notification::WorldVolumeGainChanged { mode, gain_db } => {
                if let Some(entry) = status.world_volume_db.get_mut(*mode as usize) {
                    *entry = *gain_db;
                }
            }
            Notification::WorldVolumeBalanceChanged { balance } => status.balance = *balance,
            Notification::AdaptivityPaused => status.adaptivity_enabled = false,
            Notification::AdaptivityResumed => status.adaptivity_enabled = true,
            Notification::DemoStateChanged { active } => status.demo_active = *active,
            Notification::NoiseIdEnabledChanged { enabled } => status.noise_id_enabled = *enabled,
            Notification::NoiseCategoryChanged { category } => {
                status.noise_category = Some(*category)
            }
            Notification::WindDetectionEnabledChanged { enabled } => {
                status.wind_detection_enabled = *enabled
            }
            Notification::HowlingDetectionEnabledChanged { enabled } => {
                status.howling_detection_enabled = *enabled
            }
            Notification::AdverseHandlerEnabledChanged { enabled } => {
                status.adverse_handler_enabled = *enabled
            }
            Notification::AutoAmbientEnabledChanged { enabled } => {
                status.auto_ambient_enabled = *enabled
            }
            Notification::AutoAmbientReleaseTimeChanged { seconds } => {
                status.auto_ambient_release_secs = *seconds
            }
            _ => {}
        }
    }

    /// Handle a single client connection
    async fn handle_client(
        mut stream: UnixStream,
        state: Arc<RwLock<ServerState>>,
        event_tx: mpsc::Sender<Event>,
        mut notify_rx: broadcast::Receiver<Notification>,
    ) -> Result<()> {
        let mut len_buf = [0u8; 4];

        loop {
            // Read message length (4-byte little-endian)
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > 1024 * 1024 {
                warn!(len, "message too large, disconnecting");
                return Ok(());
            }

            // Read message body
            let mut msg_buf = vec![0u8; len];
            stream.read_exact(&mut msg_buf).await?;

            // Parse request
            let request: Request =
                serde_json::from_slice(&msg_buf).context("failed to parse request")?;

            debug!(?request, "received request");

            if matches!(request, Request::Subscribe) {
                Self::send_message(&mut stream, &Response::Subscribed).await?;
                debug!("client subscribed to notifications");
                // The connection is a push stream from here on.
                return Self::push_notifications(stream, &mut notify_rx).await;
            }

            let response = Self::process_request(request, &state, &event_tx).await;
            Self::send_message(&mut stream, &response).await?;
        }
    }

    /// Forward notifications until the client goes away.
    async fn push_notifications(
        mut stream: UnixStream,
        notify_rx: &mut broadcast::Receiver<Notification>,
    ) -> Result<()> {
        loop {
            match notify_rx.recv().await {
                Ok(notification) => {
                    if Self::send_message(&mut stream, &notification).await.is_err() {
                        debug!("subscribed client disconnected");
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagged, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Send a length-prefixed JSON message
    async fn send_message<T: serde::Serialize>(stream: &mut UnixStream, msg: &T) -> Result<()> {
        let msg_bytes = serde_json::to_vec(msg)?;
        let msg_len = (msg_bytes.len() as u32).to_le_bytes();

        stream.write_all(&msg_len).await?;
        stream.write_all(&msg_bytes).await?;

        Ok(())
    }

    /// Process a request and return a response
    async fn process_request(
        request: Request,
        state: &Arc<RwLock<ServerState>>,
        event_tx: &mpsc::Sender<Event>,
    ) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => {
                let mut state = state.write().await;
                state.status.uptime_secs = state.start_time.elapsed().as_secs();
                Response::Status(state.status.clone())
            }

            command => match command.into_event() {
                Some(event) => {
                    if event_tx.send(event).await.is_err() {
                        return Response::Error {
                            code: "shutting_down".to_string(),
                            message: "state machine is no longer accepting events".to_string(),
                        };
                    }
                    Response::Accepted
                }
                None => Response::Error {
                    code: "unsupported".to_string(),
                    message: "request has no command mapping".to_string(),
                },
            },
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::Scenario;
    use crate::state::{AncConfig, BalanceSide, WorldVolumeBalance};

    #[test]
    fn test_status_tracks_configuration_notifications() {
        let mut status = DaemonStatus::new(3);

        Server::apply_notification(&mut status, &Notification::EnabledChanged { enabled: true });
        Server::apply_notification(&mut status, &Notification::ModeChanged { mode: 2 });
        Server::apply_notification(&mut status, &Notification::LeakthroughGainChanged { gain: 80 });
        Server::apply_notification(
            &mut status,
            &Notification::ToggleCycleChanged { slot: 1, config: AncConfig::Off },
        );
        Server::apply_notification(
            &mut status,
            &Notification::ScenarioConfigChanged {
                scenario: Scenario::VoiceCall,
                config: AncConfig::Mode(3),
            },
        );
        Server::apply_notification(
            &mut status,
            &Notification::WorldVolumeGainChanged { mode: 2, gain_db: -4 },
        );
        Server::apply_notification(
            &mut status,
            &Notification::WorldVolumeBalanceChanged {
                balance: WorldVolumeBalance { side: BalanceSide::Right, percentage: 30 },
            },
        );
        Server::apply_notification(&mut status, &Notification::AdaptivityPaused);
        Server::apply_notification(&mut status, &Notification::NoiseCategoryChanged { category: 1 });
        Server::apply_notification(
            &mut status,
            &Notification::WindDetectionEnabledChanged { enabled: true },
        );

        assert!(status.enabled);
        assert_eq!(status.mode, 2);
        assert_eq!(status.leakthrough_gain, Some(80));
        assert_eq!(status.toggle_cycle[1], AncConfig::Off);
        assert_eq!(status.scenario_table.get(Scenario::VoiceCall), AncConfig::Mode(3));
        assert_eq!(status.world_volume_db[2], -4);
        assert_eq!(status.balance.percentage, 30);
        assert!(!status.adaptivity_enabled);
        assert_eq!(status.noise_category, Some(1));
        assert!(status.wind_detection_enabled);
    }

    #[test]
    fn test_out_of_range_slots_leave_status_unchanged() {
        let mut status = DaemonStatus::new(2);
        Server::apply_notification(
            &mut status,
            &Notification::ToggleCycleChanged { slot: 9, config: AncConfig::Off },
        );
        Server::apply_notification(
            &mut status,
            &Notification::WorldVolumeGainChanged { mode: 7, gain_db: 3 },
        );
        assert_eq!(status.toggle_cycle, [AncConfig::Unset; 3]);
        assert_eq!(status.world_volume_db, vec![0, 0]);
    }
}
