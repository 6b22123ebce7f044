//! Event and notification types for the ANC state machine
//!
//! Every input to the state machine - user/protocol requests, environment
//! signals, signal-engine completions, timer expiries, peer messages - is one
//! variant of `Event`, consumed by a single `step` entry point. Outbound
//! `Notification`s fan out to registered clients over a broadcast channel.

use serde::{Deserialize, Serialize};

use crate::arbiter::{OutputUsers, Scenario};
use crate::peer::{PeerSnapshot, Role};
use crate::state::{AncConfig, WearState, WorldVolumeBalance};

/// Inbound events, funneled one at a time into the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Power
    PowerOn,
    PowerOff,

    // User / remote-protocol requests (gated by the re-entrancy lock)
    Enable,
    Disable,
    SetMode { mode: u8 },
    ToggleWay,
    SetLeakthroughGain { gain: u8 },
    WorldVolumeUp,
    WorldVolumeDown,
    SetWorldVolumeGain { gain_db: i8 },
    SetWorldVolumeBalance { balance: WorldVolumeBalance },
    EnterTuning,
    ExitTuning,
    EnterAdaptiveTuning,
    ExitAdaptiveTuning,

    // Configuration writes (not lock-gated; applied immediately)
    SetToggleCycleSlot { slot: u8, config: AncConfig },
    SetScenarioConfig { scenario: Scenario, config: AncConfig },
    SetDemoState { active: bool },
    PauseAdaptivity,
    ResumeAdaptivity,
    SetNoiseIdEnabled { enabled: bool },
    SetWindDetectionEnabled { enabled: bool },
    SetHowlingDetectionEnabled { enabled: bool },
    SetAdverseHandlerEnabled { enabled: bool },
    SetAutoAmbientEnabled { enabled: bool },
    SetAutoAmbientReleaseTime { seconds: u8 },
    StoreConfiguration,

    // Environment
    ScenarioConnected { users: OutputUsers },
    ScenarioDisconnected { users: OutputUsers },
    WearStateChanged { state: WearState },
    PeerWearStateChanged { state: WearState },
    SelfSpeechTriggered,
    SelfSpeechReleased,
    QuietModeDetected,
    QuietModeCleared,
    WindDetected,
    WindReleased,
    HowlingChanged { active: bool },
    NoiseCategoryChanged { category: u8 },
    UsbEnumerated,
    UsbDetached,

    // Signal-engine completions
    EnableComplete,
    DisableComplete,
    ModeChangeComplete,

    // Timer expiries (delayed self-messages)
    SettlingTimerFired,
    GentleMuteTimerFired,
    TelemetryTimerFired,

    // Peer
    PeerSnapshotReceived { snapshot: PeerSnapshot },
    PeerRoleChanged { role: Role },
}

/// Outbound notifications delivered to every registered client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    EnabledChanged { enabled: bool },
    ModeChanged { mode: u8 },
    FineGainChanged { left: u8, right: u8 },
    LeakthroughGainChanged { gain: u8 },
    PreviousConfigChanged { config: AncConfig },
    PreviousModeChanged { mode: AncConfig },
    ToggleCycleChanged { slot: u8, config: AncConfig },
    ScenarioConfigChanged { scenario: Scenario, config: AncConfig },
    DemoStateChanged { active: bool },
    AdaptivityPaused,
    AdaptivityResumed,
    WorldVolumeGainChanged { mode: u8, gain_db: i8 },
    WorldVolumeBalanceChanged { balance: WorldVolumeBalance },
    WorldVolumeConfigChanged { min_db: i8, max_db: i8, step_db: i8 },
    FfGainReport { gain: u8 },
    FbGainReport { gain: u8 },
    QuietModeChanged { detected: bool, engaged: bool },
    WindDetectionChanged { detected: bool },
    WindDetectionEnabledChanged { enabled: bool },
    HowlingChanged { active: bool },
    HowlingDetectionEnabledChanged { enabled: bool },
    AdverseHandlerEnabledChanged { enabled: bool },
    NoiseCategoryChanged { category: u8 },
    NoiseCategoryNotApplicable { mode: u8 },
    NoiseIdEnabledChanged { enabled: bool },
    AutoAmbientEnabledChanged { enabled: bool },
    AutoAmbientReleaseTimeChanged { seconds: u8 },
}
