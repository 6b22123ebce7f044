//! Configuration loading and management
//!
//! Two layers: `Config` resolves daemon paths from the environment, and
//! `AncProfile` is the product tuning table (mode classification, gains,
//! world-volume range, mic wiring, timer intervals) read from a JSON file
//! with a bring-up default when none is present.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::arbiter::ScenarioTable;
use crate::state::AncConfig;

/// Fatal startup errors. Anything here aborts the daemon.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("profile declares no modes")]
    NoModes,
    #[error("profile declares {0} modes, at most 10 are supported")]
    TooManyModes(usize),
    #[error("initial mode {mode} is out of range (num_modes = {num_modes})")]
    InitialModeOutOfRange { mode: u8, num_modes: u8 },
    #[error("internal mic {mic} is also wired as a feed-forward mic")]
    MicCollision { mic: u8 },
    #[error("Noise-ID is enabled for mode {mode} but only {categories} categories are mapped")]
    NoiseIdTableTooSmall { mode: u8, categories: usize },
    #[error("noise category {category} maps to mode {mode} which does not exist")]
    NoiseIdModeOutOfRange { category: usize, mode: u8 },
    #[error("ambient mode {0} is out of range")]
    AmbientModeOutOfRange(u8),
    #[error("world-volume range is inverted: min {min} > max {max}")]
    InvertedWorldVolumeRange { min: i8, max: i8 },
    #[error("failed to read profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse profile: {0}")]
    Format(#[from] serde_json::Error),
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for the control protocol
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Product tuning profile (optional; defaults apply when absent)
    pub profile_path: PathBuf,

    /// Persisted session block written at power-off
    pub session_path: PathBuf,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("anc-daemon");

        let socket_path = data_dir.join("daemon.sock");
        let profile_path = data_dir.join("profile.json");
        let session_path = data_dir.join("session.json");

        Ok(Self {
            socket_path,
            data_dir,
            profile_path,
            session_path,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

/// How a mode processes the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingFamily {
    /// Fixed filter configuration; gain managed by the control plane.
    Static,
    /// Hardware continuously adapts gain; enable/disable are asynchronous.
    Adaptive,
}

/// What a mode does acoustically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcousticFunction {
    Cancellation,
    Leakthrough,
    Ambient,
}

/// Classification and tuning defaults for one mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeProfile {
    pub family: ProcessingFamily,
    pub function: AcousticFunction,
    /// Whether Noise-ID classification may drive switches in this mode.
    #[serde(default)]
    pub noise_id: bool,
    /// Target fine gain per instance once the mode settles.
    pub fine_gain: [u8; 2],
    /// Default world-volume offset for leakthrough/ambient functions.
    #[serde(default)]
    pub world_volume_db: i8,
}

impl ModeProfile {
    pub fn is_adaptive(&self) -> bool {
        self.family == ProcessingFamily::Adaptive
    }

    pub fn passes_world(&self) -> bool {
        matches!(
            self.function,
            AcousticFunction::Leakthrough | AcousticFunction::Ambient
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorldVolumeRange {
    pub min_db: i8,
    pub max_db: i8,
    pub step_db: i8,
}

/// Microphone wiring, by platform mic id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicConfig {
    pub feed_forward_left: u8,
    pub feed_forward_right: Option<u8>,
    /// Internal (feed-back / voice) mic, where fitted.
    pub internal: Option<u8>,
}

/// What happens to enable state and mode across a power cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BootBehaviour {
    pub initial_enabled: bool,
    pub persist_enabled: bool,
    pub initial_mode: u8,
    pub persist_mode: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimerIntervals {
    /// Settling delay between a hardware mode/enable and gain reapplication.
    pub settling_ms: u64,
    /// Gentle-mute duration before an adaptive teardown or filter switch.
    pub gentle_mute_ms: u64,
    /// Gain telemetry sampling period.
    pub telemetry_ms: u64,
}

impl Default for TimerIntervals {
    fn default() -> Self {
        Self {
            settling_ms: 500,
            gentle_mute_ms: 300,
            telemetry_ms: 500,
        }
    }
}

/// Product tuning profile for the ANC control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AncProfile {
    pub modes: Vec<ModeProfile>,
    pub world_volume: WorldVolumeRange,
    pub mic: MicConfig,
    pub boot: BootBehaviour,
    #[serde(default)]
    pub timers: TimerIntervals,
    /// Both gain instances present (left/right on a single device).
    #[serde(default)]
    pub dual_instance: bool,
    /// Adaptive filter switch without an intervening mute.
    #[serde(default)]
    pub fast_mode_switch: bool,
    /// Mode entered on a self-speech trigger, if auto-ambient is fitted.
    #[serde(default)]
    pub ambient_mode: Option<u8>,
    #[serde(default)]
    pub auto_ambient_release_secs: u8,
    /// Noise-ID category to mode map, indexed by category.
    #[serde(default)]
    pub noise_id_mode_for_category: Vec<u8>,
    /// Factory toggle-way cycle.
    #[serde(default = "default_toggle_cycle")]
    pub toggle_cycle: [AncConfig; 3],
    /// Factory scenario overrides.
    #[serde(default)]
    pub scenario_table: ScenarioTable,
}

fn default_toggle_cycle() -> [AncConfig; 3] {
    [AncConfig::Unset, AncConfig::Unset, AncConfig::Unset]
}

impl Default for AncProfile {
    fn default() -> Self {
        // Bring-up profile: one static cancellation mode, one adaptive
        // cancellation mode, one static ambient mode.
        Self {
            modes: vec![
                ModeProfile {
                    family: ProcessingFamily::Static,
                    function: AcousticFunction::Cancellation,
                    noise_id: false,
                    fine_gain: [128, 128],
                    world_volume_db: 0,
                },
                ModeProfile {
                    family: ProcessingFamily::Adaptive,
                    function: AcousticFunction::Cancellation,
                    noise_id: false,
                    fine_gain: [128, 128],
                    world_volume_db: 0,
                },
                ModeProfile {
                    family: ProcessingFamily::Static,
                    function: AcousticFunction::Ambient,
                    noise_id: false,
                    fine_gain: [100, 100],
                    world_volume_db: 0,
                },
            ],
            world_volume: WorldVolumeRange { min_db: -6, max_db: 6, step_db: 1 },
            mic: MicConfig {
                feed_forward_left: 0,
                feed_forward_right: Some(1),
                internal: Some(2),
            },
            boot: BootBehaviour {
                initial_enabled: false,
                persist_enabled: true,
                initial_mode: 0,
                persist_mode: true,
            },
            timers: TimerIntervals::default(),
            dual_instance: true,
            fast_mode_switch: false,
            ambient_mode: Some(2),
            auto_ambient_release_secs: 5,
            noise_id_mode_for_category: Vec::new(),
            toggle_cycle: [AncConfig::Mode(1), AncConfig::Off, AncConfig::Mode(3)],
            scenario_table: ScenarioTable::default(),
        }
    }
}

impl AncProfile {
    /// Read the profile from `path`, falling back to the bring-up default
    /// when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, InitError> {
        let profile = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let profile: AncProfile = serde_json::from_str(&raw)?;
            info!(?path, modes = profile.modes.len(), "profile loaded");
            profile
        } else {
            info!(?path, "no profile file, using bring-up defaults");
            AncProfile::default()
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn num_modes(&self) -> u8 {
        self.modes.len() as u8
    }

    pub fn mode(&self, index: u8) -> Option<&ModeProfile> {
        self.modes.get(index as usize)
    }

    /// Consistency checks that must hold before the state machine starts.
    pub fn validate(&self) -> Result<(), InitError> {
        if self.modes.is_empty() {
            return Err(InitError::NoModes);
        }
        if self.modes.len() > 10 {
            return Err(InitError::TooManyModes(self.modes.len()));
        }
        if self.boot.initial_mode >= self.num_modes() {
            return Err(InitError::InitialModeOutOfRange {
                mode: self.boot.initial_mode,
                num_modes: self.num_modes(),
            });
        }
        if self.world_volume.min_db > self.world_volume.max_db {
            return Err(InitError::InvertedWorldVolumeRange {
                min: self.world_volume.min_db,
                max: self.world_volume.max_db,
            });
        }

        if let Some(internal) = self.mic.internal {
            if internal == self.mic.feed_forward_left
                || Some(internal) == self.mic.feed_forward_right
            {
                return Err(InitError::MicCollision { mic: internal });
            }
        }

        for (index, mode) in self.modes.iter().enumerate() {
            if mode.noise_id && self.noise_id_mode_for_category.len() < 2 {
                return Err(InitError::NoiseIdTableTooSmall {
                    mode: index as u8,
                    categories: self.noise_id_mode_for_category.len(),
                });
            }
        }
        for (category, mode) in self.noise_id_mode_for_category.iter().enumerate() {
            if *mode >= self.num_modes() {
                return Err(InitError::NoiseIdModeOutOfRange { category, mode: *mode });
            }
        }

        if let Some(ambient) = self.ambient_mode {
            if ambient >= self.num_modes() {
                return Err(InitError::AmbientModeOutOfRange(ambient));
            }
        }

        Ok(())
    }
}
