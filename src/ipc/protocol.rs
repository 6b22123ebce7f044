//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.
//! Command requests map one-to-one onto state machine events; `Subscribe`
//! turns the connection into a push stream of state notifications.

use serde::{Deserialize, Serialize};

use crate::arbiter::{Scenario, ScenarioTable};
use crate::events::Event;
use crate::state::{AncConfig, WorldVolumeBalance};

/// Requests from a control client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current daemon status
    GetStatus,

    /// Ping to check connectivity
    Ping,

    /// Subscribe to state change notifications
    Subscribe,

    // ANC commands
    SetEnabled { enabled: bool },
    SetMode { mode: u8 },
    ToggleWay,
    SetLeakthroughGain { gain: u8 },
    SetToggleCycleSlot { slot: u8, config: AncConfig },
    SetScenarioConfig { scenario: Scenario, config: AncConfig },
    SetDemoState { active: bool },
    PauseAdaptivity,
    ResumeAdaptivity,
    SetWorldVolumeGain { gain_db: i8 },
    WorldVolumeUp,
    WorldVolumeDown,
    SetWorldVolumeBalance { balance: WorldVolumeBalance },
    SetNoiseIdEnabled { enabled: bool },
    SetWindDetectionEnabled { enabled: bool },
    SetHowlingDetectionEnabled { enabled: bool },
    SetAdverseHandlerEnabled { enabled: bool },
    SetAutoAmbientEnabled { enabled: bool },
    SetAutoAmbientReleaseTime { seconds: u8 },
    StoreConfiguration,
}

impl Request {
    /// The state machine event this request commands, if any. Queries
    /// (`GetStatus`, `Ping`, `Subscribe`) are answered by the server itself.
    pub fn into_event(self) -> Option<Event> {
        match self {
            Request::GetStatus | Request::Ping | Request::Subscribe => None,
            Request::SetEnabled { enabled } => {
                Some(if enabled { Event::Enable } else { Event::Disable })
            }
            Request::SetMode { mode } => Some(Event::SetMode { mode }),
            Request::ToggleWay => Some(Event::ToggleWay),
            Request::SetLeakthroughGain { gain } => Some(Event::SetLeakthroughGain { gain }),
            Request::SetToggleCycleSlot { slot, config } => {
                Some(Event::SetToggleCycleSlot { slot, config })
            }
            Request::SetScenarioConfig { scenario, config } => {
                Some(Event::SetScenarioConfig { scenario, config })
            }
            Request::SetDemoState { active } => Some(Event::SetDemoState { active }),
            Request::PauseAdaptivity => Some(Event::PauseAdaptivity),
            Request::ResumeAdaptivity => Some(Event::ResumeAdaptivity),
            Request::SetWorldVolumeGain { gain_db } => Some(Event::SetWorldVolumeGain { gain_db }),
            Request::WorldVolumeUp => Some(Event::WorldVolumeUp),
            Request::WorldVolumeDown => Some(Event::WorldVolumeDown),
            Request::SetWorldVolumeBalance { balance } => {
                Some(Event::SetWorldVolumeBalance { balance })
            }
            Request::SetNoiseIdEnabled { enabled } => Some(Event::SetNoiseIdEnabled { enabled }),
            Request::SetWindDetectionEnabled { enabled } => {
                Some(Event::SetWindDetectionEnabled { enabled })
            }
            Request::SetHowlingDetectionEnabled { enabled } => {
                Some(Event::SetHowlingDetectionEnabled { enabled })
            }
            Request::SetAdverseHandlerEnabled { enabled } => {
                Some(Event::SetAdverseHandlerEnabled { enabled })
            }
            Request::SetAutoAmbientEnabled { enabled } => {
                Some(Event::SetAutoAmbientEnabled { enabled })
            }
            Request::SetAutoAmbientReleaseTime { seconds } => {
                Some(Event::SetAutoAmbientReleaseTime { seconds })
            }
            Request::StoreConfiguration => Some(Event::StoreConfiguration),
        }
    }
}

/// Responses from daemon to a control client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Command accepted and queued for the state machine
    Accepted,

    /// Current daemon status
    Status(DaemonStatus),

    /// Pong response to ping
    Pong,

    /// Subscription confirmed; notifications follow on this connection
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

/// Status snapshot maintained by the server from state notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Whether the ANC path is enabled
    pub enabled: bool,

    /// Current mode index
    pub mode: u8,

    /// Number of modes the product profile declares
    pub num_modes: u8,

    /// Previous configuration (raw wire value)
    pub previous_config: AncConfig,

    /// Previous mode, stamped before overrides and disables
    pub previous_mode: AncConfig,

    /// Last user-adjusted leakthrough fine gain, if any
    pub leakthrough_gain: Option<u8>,

    /// Toggle-way cycle slots
    pub toggle_cycle: [AncConfig; 3],

    /// Per-scenario concurrency overrides
    pub scenario_table: ScenarioTable,

    /// Stored world-volume gain per mode, dB
    pub world_volume_db: Vec<i8>,

    /// World-volume left/right balance
    pub balance: WorldVolumeBalance,

    /// Whether adaptive gain tracking is running (not paused)
    pub adaptivity_enabled: bool,

    /// Whether the gain demo (telemetry stream) is running
    pub demo_active: bool,

    /// Whether Noise-ID driven switching is on
    pub noise_id_enabled: bool,

    /// Latest ambient noise category, once one has been reported
    pub noise_category: Option<u8>,

    /// Detection-handler switches
    pub wind_detection_enabled: bool,
    pub howling_detection_enabled: bool,
    pub adverse_handler_enabled: bool,

    /// Self-speech auto-ambient switch and release time
    pub auto_ambient_enabled: bool,
    pub auto_ambient_release_secs: u8,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl DaemonStatus {
    pub fn new(num_modes: u8) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            enabled: false,
            mode: 0,
            num_modes,
            previous_config: AncConfig::Unset,
            previous_mode: AncConfig::Unset,
            leakthrough_gain: None,
            toggle_cycle: [AncConfig::Unset; 3],
            scenario_table: ScenarioTable::default(),
            world_volume_db: vec![0; num_modes as usize],
            balance: WorldVolumeBalance::centered(),
            adaptivity_enabled: true,
            demo_active: false,
            noise_id_enabled: false,
            noise_category: None,
            wind_detection_enabled: false,
            howling_detection_enabled: false,
            adverse_handler_enabled: false,
            auto_ambient_enabled: false,
            auto_ambient_release_secs: 0,
            uptime_secs: 0,
        }
    }
}
