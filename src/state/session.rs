//! Session state and its pure helpers
//!
//! One owned record per device. The state machine is the only writer; the
//! helpers here (toggle-cycle traversal, previous-config derivation, balance
//! encoding) are pure so they can be tested without a machine.

use serde::{Deserialize, Serialize};

use crate::arbiter::{Scenario, ScenarioTable};
use crate::config::AncProfile;

/// Raw wire value for "off" in toggle and scenario configuration.
const CONFIG_OFF: u8 = 0x00;
/// Raw wire value for "unconfigured" / "same as current".
const CONFIG_UNSET: u8 = 0xFF;

/// A toggle or scenario configuration entry: a 1-based mode number, an
/// explicit off, or unconfigured (which for scenarios means "same as
/// current").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum AncConfig {
    Off,
    Mode(u8),
    Unset,
}

impl AncConfig {
    /// Build from a 0-based mode index.
    pub fn from_mode_index(index: u8) -> Self {
        AncConfig::Mode(index + 1)
    }

    /// 0-based mode index, if this entry names a mode.
    pub fn mode_index(self) -> Option<u8> {
        match self {
            AncConfig::Mode(n) if n >= 1 => Some(n - 1),
            _ => None,
        }
    }

    pub fn is_valid_mode(self, num_modes: u8) -> bool {
        matches!(self, AncConfig::Mode(n) if n >= 1 && n <= num_modes)
    }
}

impl From<u8> for AncConfig {
    fn from(raw: u8) -> Self {
        match raw {
            CONFIG_OFF => AncConfig::Off,
            CONFIG_UNSET => AncConfig::Unset,
            n => AncConfig::Mode(n),
        }
    }
}

impl From<AncConfig> for u8 {
    fn from(config: AncConfig) -> Self {
        match config {
            AncConfig::Off => CONFIG_OFF,
            AncConfig::Unset => CONFIG_UNSET,
            AncConfig::Mode(n) => n,
        }
    }
}

/// Physical wear state of an earbud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WearState {
    InEar,
    OutOfEar,
    InCase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceSide {
    Left,
    Right,
}

/// World-volume left/right balance. On the wire this is one byte: bit 7
/// carries the side, bits 0..=6 the percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldVolumeBalance {
    pub side: BalanceSide,
    pub percentage: u8,
}

impl WorldVolumeBalance {
    pub fn centered() -> Self {
        Self { side: BalanceSide::Left, percentage: 0 }
    }

    pub fn encode(&self) -> u8 {
        let side = match self.side {
            BalanceSide::Left => 0,
            BalanceSide::Right => 0x80,
        };
        side | self.percentage.min(100)
    }

    pub fn decode(raw: u8) -> Self {
        let side = if raw & 0x80 != 0 { BalanceSide::Right } else { BalanceSide::Left };
        Self { side, percentage: (raw & 0x7F).min(100) }
    }
}

/// The single mutable record for one device's ANC control state.
#[derive(Debug, Clone)]
pub struct Session {
    pub current_mode: u8,
    pub requested_mode: u8,
    pub requested_enabled: bool,
    pub actual_enabled: bool,

    /// Configuration active before the last disable / concurrency override,
    /// used for restore. Also tracks the toggle cycle's phase.
    pub previous_config: AncConfig,
    /// Mode active before the last genuine disable, as a 1-based entry.
    pub previous_mode: AncConfig,

    /// Cached per-instance fine gain as last written to hardware.
    pub fine_gain: [u8; 2],
    /// Latest sampled feed-forward / feed-back gain (telemetry).
    pub ff_gain: u8,
    pub fb_gain: u8,
    /// User-adjusted leakthrough gain per mode; `None` means the profile
    /// default applies.
    pub leakthrough_gain: Vec<Option<u8>>,

    pub world_volume_db: Vec<i8>,
    pub balance: WorldVolumeBalance,

    pub toggle_cycle: [AncConfig; 3],
    pub scenario_table: ScenarioTable,
    pub concurrency_active: bool,
    pub active_scenario: Option<Scenario>,
    pub self_speech_active: bool,
    pub system_triggered_disable: bool,

    pub adaptivity_enabled: bool,
    pub demo_active: bool,
    pub wear_state: WearState,
    pub peer_wear_state: WearState,

    pub noise_id_enabled: bool,
    pub noise_category: Option<u8>,
    pub quiet_mode_detected: bool,
    pub quiet_mode_engaged: bool,
    pub wind_detection_enabled: bool,
    pub howling_detection_enabled: bool,
    pub adverse_handler_enabled: bool,
    pub auto_ambient_enabled: bool,
    pub auto_ambient_release_secs: u8,
}

impl Session {
    pub fn new(profile: &AncProfile) -> Self {
        let num_modes = profile.num_modes() as usize;
        Self {
            current_mode: profile.boot.initial_mode,
            requested_mode: profile.boot.initial_mode,
            requested_enabled: false,
            actual_enabled: false,
            previous_config: AncConfig::Unset,
            previous_mode: AncConfig::from_mode_index(profile.boot.initial_mode),
            fine_gain: [0, 0],
            ff_gain: 0,
            fb_gain: 0,
            leakthrough_gain: vec![None; num_modes],
            world_volume_db: profile.modes.iter().map(|m| m.world_volume_db).collect(),
            balance: WorldVolumeBalance::centered(),
            toggle_cycle: profile.toggle_cycle,
            scenario_table: profile.scenario_table.clone(),
            concurrency_active: false,
            active_scenario: None,
            self_speech_active: false,
            system_triggered_disable: false,
            adaptivity_enabled: true,
            demo_active: false,
            wear_state: WearState::InEar,
            peer_wear_state: WearState::InEar,
            noise_id_enabled: false,
            noise_category: None,
            quiet_mode_detected: false,
            quiet_mode_engaged: false,
            wind_detection_enabled: false,
            howling_detection_enabled: false,
            adverse_handler_enabled: false,
            auto_ambient_enabled: false,
            auto_ambient_release_secs: profile.auto_ambient_release_secs,
        }
    }

    /// Configuration describing the present requested state, used to stamp
    /// `previous_config`/`previous_mode` before an override or disable.
    pub fn derive_previous(&self) -> (AncConfig, AncConfig) {
        let mode = AncConfig::from_mode_index(self.requested_mode);
        let config = if self.requested_enabled { mode } else { AncConfig::Off };
        (config, mode)
    }

    /// First-writer-wins guard: only the first of {concurrency, self-speech}
    /// to arrive may stamp `previous_*`.
    pub fn may_stamp_previous(&self) -> bool {
        !self.concurrency_active && !self.self_speech_active
    }
}

/// Next toggle entry when the device is enabled: the entry after the one
/// matching the current mode, wrapping, provided it is off or a valid mode.
pub fn next_toggle_enabled(cycle: &[AncConfig; 3], current_mode: u8, num_modes: u8) -> AncConfig {
    let current = AncConfig::from_mode_index(current_mode);
    for (i, entry) in cycle.iter().enumerate() {
        if *entry == AncConfig::Unset {
            break;
        }
        if *entry == current {
            let next = cycle[(i + 1) % cycle.len()];
            if next == AncConfig::Off || next.is_valid_mode(num_modes) {
                return next;
            }
        }
    }
    cycle[0]
}

/// Next toggle entry when the device is disabled. If the cycle itself turned
/// the device off (`previous_config == Off`), resume after that off entry;
/// otherwise start over from the first valid mode in the cycle.
pub fn next_toggle_disabled(
    cycle: &[AncConfig; 3],
    previous_config: AncConfig,
    num_modes: u8,
) -> AncConfig {
    if previous_config == AncConfig::Off {
        for (i, entry) in cycle.iter().enumerate() {
            if *entry == AncConfig::Unset {
                break;
            }
            if *entry == AncConfig::Off {
                let next = cycle[(i + 1) % cycle.len()];
                if next.is_valid_mode(num_modes) {
                    return next;
                }
            }
        }
    }

    for entry in cycle {
        if *entry == AncConfig::Unset {
            break;
        }
        if entry.is_valid_mode(num_modes) {
            return *entry;
        }
    }
    cycle[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(raw: [u8; 3]) -> [AncConfig; 3] {
        [raw[0].into(), raw[1].into(), raw[2].into()]
    }

    #[test]
    fn test_anc_config_raw_round_trip() {
        assert_eq!(AncConfig::from(0x00), AncConfig::Off);
        assert_eq!(AncConfig::from(0xFF), AncConfig::Unset);
        assert_eq!(AncConfig::from(4), AncConfig::Mode(4));
        assert_eq!(u8::from(AncConfig::Mode(4)), 4);
        assert_eq!(AncConfig::Mode(3).mode_index(), Some(2));
        assert_eq!(AncConfig::Off.mode_index(), None);
    }

    #[test]
    fn test_mode_validity_against_mode_count() {
        assert!(AncConfig::Mode(3).is_valid_mode(3));
        assert!(!AncConfig::Mode(4).is_valid_mode(3));
        assert!(!AncConfig::Off.is_valid_mode(3));
        assert!(!AncConfig::Unset.is_valid_mode(3));
    }

    #[test]
    fn test_balance_encoding() {
        let balance = WorldVolumeBalance { side: BalanceSide::Right, percentage: 40 };
        assert_eq!(balance.encode(), 0x80 | 40);
        assert_eq!(WorldVolumeBalance::decode(0x80 | 40), balance);

        let balance = WorldVolumeBalance { side: BalanceSide::Left, percentage: 100 };
        assert_eq!(balance.encode(), 100);

        // Percentage saturates at 100 in both directions.
        let over = WorldVolumeBalance { side: BalanceSide::Left, percentage: 127 };
        assert_eq!(over.encode(), 100);
        assert_eq!(WorldVolumeBalance::decode(0x7F).percentage, 100);
    }

    #[test]
    fn test_toggle_enabled_advances_past_current() {
        let cycle = cycle([1, 0, 3]);
        assert_eq!(next_toggle_enabled(&cycle, 0, 3), AncConfig::Off);
        assert_eq!(next_toggle_enabled(&cycle, 2, 3), AncConfig::Mode(1));
    }

    #[test]
    fn test_toggle_enabled_current_not_in_cycle_falls_back() {
        let cycle = cycle([1, 0, 3]);
        // Current mode 2 (entry value 2) is not in the cycle.
        assert_eq!(next_toggle_enabled(&cycle, 1, 3), AncConfig::Mode(1));
    }

    #[test]
    fn test_toggle_enabled_skips_invalid_next() {
        // Entry after mode 1 names mode 9 which does not exist; traversal
        // falls back to slot 0.
        let cycle = cycle([1, 9, 3]);
        assert_eq!(next_toggle_enabled(&cycle, 0, 3), AncConfig::Mode(1));
    }

    #[test]
    fn test_toggle_disabled_fresh_start_takes_first_mode() {
        let cycle = cycle([1, 0, 3]);
        assert_eq!(
            next_toggle_disabled(&cycle, AncConfig::Unset, 3),
            AncConfig::Mode(1)
        );
    }

    #[test]
    fn test_toggle_disabled_after_cycle_off_resumes() {
        let cycle = cycle([1, 0, 3]);
        assert_eq!(
            next_toggle_disabled(&cycle, AncConfig::Off, 3),
            AncConfig::Mode(3)
        );
    }

    #[test]
    fn test_toggle_disabled_off_in_last_slot_wraps() {
        let cycle = cycle([1, 3, 0]);
        assert_eq!(
            next_toggle_disabled(&cycle, AncConfig::Off, 3),
            AncConfig::Mode(1)
        );
    }

    #[test]
    fn test_toggle_unconfigured_cycle_yields_unset() {
        let cycle = cycle([0xFF, 0xFF, 0xFF]);
        assert_eq!(next_toggle_enabled(&cycle, 0, 3), AncConfig::Unset);
        assert_eq!(
            next_toggle_disabled(&cycle, AncConfig::Unset, 3),
            AncConfig::Unset
        );
    }
}
