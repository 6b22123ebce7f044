//! Peer synchronization adapter
//!
//! Two paired earbuds keep their ANC session state mirrored. One device is
//! elected primary by an external role negotiation; only the primary
//! originates state-changing traffic, while gain telemetry flows both ways.
//! On (re)connection a full snapshot is exchanged and applied by the state
//! machine in two phases: configuration fields first, gain/demo/world-volume
//! only after any asynchronous hardware enable has completed.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::arbiter::ScenarioTable;
use crate::state::{AncConfig, Session, WorldVolumeBalance};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer link closed")]
    Closed,
    #[error("peer transport failure: {0}")]
    Transport(String),
}

/// Elected role of this device within the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
}

/// The subset of session state a reconnecting peer needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub enabled: bool,
    pub mode: u8,
    pub previous_config: AncConfig,
    pub previous_mode: AncConfig,
    pub toggle_cycle: [AncConfig; 3],
    pub scenario_table: ScenarioTable,
    pub leakthrough_gain: Vec<Option<u8>>,
    pub demo_active: bool,
    pub adaptivity_enabled: bool,
    pub world_volume_db: Vec<i8>,
    pub balance: WorldVolumeBalance,
    pub noise_id_enabled: bool,
}

impl PeerSnapshot {
    /// Capture the mirrored subset of a session.
    pub fn capture(session: &Session) -> Self {
        Self {
            enabled: session.requested_enabled,
            mode: session.requested_mode,
            previous_config: session.previous_config,
            previous_mode: session.previous_mode,
            toggle_cycle: session.toggle_cycle,
            scenario_table: session.scenario_table.clone(),
            leakthrough_gain: session.leakthrough_gain.clone(),
            demo_active: session.demo_active,
            adaptivity_enabled: session.adaptivity_enabled,
            world_volume_db: session.world_volume_db.clone(),
            balance: session.balance,
            noise_id_enabled: session.noise_id_enabled,
        }
    }
}

/// Messages carried over the peer transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Snapshot(PeerSnapshot),
    GainReport { ff_gain: u8, fb_gain: u8 },
}

/// Send half of the peer channel; the receive half arrives as events.
pub trait PeerTransport: Send {
    fn send(&mut self, message: &PeerMessage) -> Result<(), PeerError>;
}

/// Role plus an optional transport. A device without a connected peer
/// simply has no transport attached; publishing is then a no-op.
pub struct PeerLink {
    role: Role,
    transport: Option<Box<dyn PeerTransport>>,
}

impl PeerLink {
    pub fn new(role: Role) -> Self {
        Self { role, transport: None }
    }

    pub fn with_transport(role: Role, transport: Box<dyn PeerTransport>) -> Self {
        Self { role, transport: Some(transport) }
    }

    pub fn attach(&mut self, transport: Box<dyn PeerTransport>) {
        self.transport = Some(transport);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// Push a state snapshot to the peer. Only the primary originates
    /// state-changing traffic.
    pub fn publish_snapshot(&mut self, session: &Session) {
        if !self.is_primary() {
            return;
        }
        let message = PeerMessage::Snapshot(PeerSnapshot::capture(session));
        self.send(&message);
    }

    /// Gain telemetry is mirrored regardless of role.
    pub fn publish_gain(&mut self, ff_gain: u8, fb_gain: u8) {
        self.send(&PeerMessage::GainReport { ff_gain, fb_gain });
    }

    fn send(&mut self, message: &PeerMessage) {
        let Some(transport) = self.transport.as_mut() else {
            debug!("no peer attached, dropping peer message");
            return;
        };
        if let Err(e) = transport.send(message) {
            warn!(?e, "peer send failed");
        }
    }
}
