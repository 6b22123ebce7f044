//! Persisted session block
//!
//! A small JSON block written at power-off and on explicit store requests,
//! read once at power-on. What survives a power cycle is governed by the
//! profile's boot behaviour flags.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::arbiter::ScenarioTable;
use crate::state::{AncConfig, Session, WorldVolumeBalance};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store format: {0}")]
    Format(#[from] serde_json::Error),
}

/// The persisted subset of session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub enabled: bool,
    pub mode: u8,
    pub toggle_cycle: [AncConfig; 3],
    pub scenario_table: ScenarioTable,
    pub world_volume_db: Vec<i8>,
    pub balance: WorldVolumeBalance,
    pub noise_id_enabled: bool,
    pub auto_ambient_enabled: bool,
    pub auto_ambient_release_secs: u8,
}

impl SessionData {
    pub fn capture(session: &Session) -> Self {
        Self {
            enabled: session.requested_enabled,
            mode: session.requested_mode,
            toggle_cycle: session.toggle_cycle,
            scenario_table: session.scenario_table.clone(),
            world_volume_db: session.world_volume_db.clone(),
            balance: session.balance,
            noise_id_enabled: session.noise_id_enabled,
            auto_ambient_enabled: session.auto_ambient_enabled,
            auto_ambient_release_secs: session.auto_ambient_release_secs,
        }
    }
}

pub trait SessionStore: Send {
    fn load(&self) -> Result<Option<SessionData>, StoreError>;
    fn save(&self, data: &SessionData) -> Result<(), StoreError>;
}

/// File-backed store used by the daemon.
pub struct JsonSessionStore {
    path: PathBuf,
}

impl JsonSessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SessionStore for JsonSessionStore {
    fn load(&self) -> Result<Option<SessionData>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let data = serde_json::from_str(&raw)?;
        debug!(path = ?self.path, "session block loaded");
        Ok(Some(data))
    }

    fn save(&self, data: &SessionData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(data)?)?;
        debug!(path = ?self.path, "session block written");
        Ok(())
    }
}

/// Discards everything; for volatile products and tests.
pub struct NullSessionStore;

impl SessionStore for NullSessionStore {
    fn load(&self) -> Result<Option<SessionData>, StoreError> {
        Ok(None)
    }

    fn save(&self, _data: &SessionData) -> Result<(), StoreError> {
        Ok(())
    }
}
