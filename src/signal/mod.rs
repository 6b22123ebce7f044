//! Signal engine boundary
//!
//! The DSP side of ANC is a black box behind `SignalEngine`: the control
//! plane issues enable/disable/mode/gain commands and receives completion
//! events for the asynchronous ones. `LoopbackEngine` is the host-side
//! implementation used for bring-up and tests; it acknowledges every
//! asynchronous command by posting the completion straight back into the
//! event channel.

mod loopback;

pub use loopback::LoopbackEngine;

use thiserror::Error;

use crate::gain::Instances;
use crate::state::WorldVolumeBalance;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("signal engine rejected {op}")]
    Rejected { op: &'static str },
    #[error("signal engine unavailable")]
    Unavailable,
}

/// How a mutating engine call completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Took effect before the call returned.
    Done,
    /// In flight; a completion event will arrive later. The caller must
    /// keep the re-entrancy lock held until it does.
    Pending,
}

/// Microphone users known to the mic pool collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicUser {
    AncFeedForward,
    AncFeedBack,
}

/// Capability to acquire/release named microphone channels. Arbitration of
/// overlapping users belongs to the collaborator, not this crate.
pub trait MicPool: Send {
    fn acquire(&mut self, mic: u8, user: MicUser, sample_rate_hz: u32) -> Result<(), EngineError>;
    fn release(&mut self, mic: u8, user: MicUser);
}

/// Command surface of the ANC hardware/DSP.
pub trait SignalEngine: Send {
    /// Power the ANC path in `mode`. Adaptive modes complete asynchronously.
    fn enable(&mut self, mode: u8, adaptive: bool) -> Result<Ack, EngineError>;

    /// Tear the ANC path down.
    fn disable(&mut self) -> Result<Ack, EngineError>;

    /// Swap filters to `mode` without a power cycle. With `fast` set the
    /// swap happens without an intervening mute.
    fn set_mode(&mut self, mode: u8, adaptive: bool, fast: bool) -> Result<Ack, EngineError>;

    /// Instantaneous coarse gain application for `mode`.
    fn apply_coarse_gain(&mut self, mode: u8) -> Result<(), EngineError>;

    /// One fine-gain register write (one step of a ramp plan).
    fn write_fine_gain(&mut self, instances: Instances, gain: u8) -> Result<(), EngineError>;

    /// Hardware-assisted short ramp-down before an adaptive teardown.
    fn gentle_mute(&mut self) -> Result<(), EngineError>;

    fn read_ff_gain(&mut self) -> Result<u8, EngineError>;
    fn read_fb_gain(&mut self) -> Result<u8, EngineError>;

    fn set_world_volume(&mut self, gain_db: i8) -> Result<(), EngineError>;
    fn set_world_volume_balance(&mut self, balance: &WorldVolumeBalance) -> Result<(), EngineError>;

    /// Pause/resume adaptive gain convergence.
    fn set_adaptivity(&mut self, enabled: bool) -> Result<(), EngineError>;

    fn set_quiet_mode(&mut self, engaged: bool) -> Result<(), EngineError>;
    fn set_wind_detection(&mut self, enabled: bool) -> Result<(), EngineError>;
    fn set_howling_detection(&mut self, enabled: bool) -> Result<(), EngineError>;
    fn set_adverse_handler(&mut self, enabled: bool) -> Result<(), EngineError>;

    fn enter_tuning(&mut self, adaptive: bool) -> Result<(), EngineError>;
    fn exit_tuning(&mut self) -> Result<(), EngineError>;
}
