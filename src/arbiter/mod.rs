//! Concurrency arbiter
//!
//! Maps "what else is using audio right now" to a concurrency scenario and
//! decides which ANC configuration that scenario wants. The state machine
//! owns all side effects; everything here is a pure decision.

use serde::{Deserialize, Serialize};

use crate::state::AncConfig;

/// Output consumers currently active on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputUsers {
    pub voice_call: bool,
    pub media: bool,
    pub voice_assistant: bool,
    pub stereo_recording: bool,
}

/// Concurrency scenarios, one override slot each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Standalone,
    Playback,
    VoiceCall,
    VoiceAssistant,
    StereoRecording,
}

impl Scenario {
    /// Scenario precedence: voice call beats media; within media a voice
    /// assistant overlay beats plain playback; stereo recording comes last
    /// before standalone.
    pub fn from_users(users: &OutputUsers) -> Self {
        if users.voice_call {
            Scenario::VoiceCall
        } else if users.media && users.voice_assistant {
            Scenario::VoiceAssistant
        } else if users.media {
            Scenario::Playback
        } else if users.stereo_recording {
            Scenario::StereoRecording
        } else {
            Scenario::Standalone
        }
    }

    pub fn is_standalone(self) -> bool {
        self == Scenario::Standalone
    }
}

/// Per-scenario ANC configuration overrides. `Unset` means "same as
/// current": the scenario does not care.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioTable {
    pub standalone: AncConfig,
    pub playback: AncConfig,
    pub voice_call: AncConfig,
    pub voice_assistant: AncConfig,
    pub stereo_recording: AncConfig,
}

impl Default for ScenarioTable {
    fn default() -> Self {
        Self {
            standalone: AncConfig::Unset,
            playback: AncConfig::Unset,
            voice_call: AncConfig::Unset,
            voice_assistant: AncConfig::Unset,
            stereo_recording: AncConfig::Unset,
        }
    }
}

impl ScenarioTable {
    pub fn get(&self, scenario: Scenario) -> AncConfig {
        match scenario {
            Scenario::Standalone => self.standalone,
            Scenario::Playback => self.playback,
            Scenario::VoiceCall => self.voice_call,
            Scenario::VoiceAssistant => self.voice_assistant,
            Scenario::StereoRecording => self.stereo_recording,
        }
    }

    pub fn set(&mut self, scenario: Scenario, config: AncConfig) {
        let slot = match scenario {
            Scenario::Standalone => &mut self.standalone,
            Scenario::Playback => &mut self.playback,
            Scenario::VoiceCall => &mut self.voice_call,
            Scenario::VoiceAssistant => &mut self.voice_assistant,
            Scenario::StereoRecording => &mut self.stereo_recording,
        };
        *slot = config;
    }
}

/// What to do when a scenario connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    /// Scenario override is "same as current": leave the configuration
    /// alone (but the previous state is still snapshotted).
    LeaveCurrent,
    /// Apply this configuration for the duration of the scenario.
    Apply(AncConfig),
}

pub fn connect_action(table: &ScenarioTable, scenario: Scenario) -> ConnectAction {
    match table.get(scenario) {
        AncConfig::Unset => ConnectAction::LeaveCurrent,
        config => ConnectAction::Apply(config),
    }
}

/// What to do when the last concurrency scenario disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectAction {
    /// Standalone override is "same as current": restore the snapshotted
    /// previous configuration.
    RestorePrevious,
    /// A standalone configuration is pinned; apply it.
    Apply(AncConfig),
}

pub fn disconnect_action(table: &ScenarioTable) -> DisconnectAction {
    match table.standalone {
        AncConfig::Unset => DisconnectAction::RestorePrevious,
        config => DisconnectAction::Apply(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_precedence() {
        let mut users = OutputUsers::default();
        assert_eq!(Scenario::from_users(&users), Scenario::Standalone);

        users.stereo_recording = true;
        assert_eq!(Scenario::from_users(&users), Scenario::StereoRecording);

        users.media = true;
        assert_eq!(Scenario::from_users(&users), Scenario::Playback);

        users.voice_assistant = true;
        assert_eq!(Scenario::from_users(&users), Scenario::VoiceAssistant);

        users.voice_call = true;
        assert_eq!(Scenario::from_users(&users), Scenario::VoiceCall);
    }

    #[test]
    fn test_assistant_without_media_is_standalone() {
        let users = OutputUsers { voice_assistant: true, ..Default::default() };
        assert_eq!(Scenario::from_users(&users), Scenario::Standalone);
    }

    #[test]
    fn test_connect_action_same_as_current() {
        let table = ScenarioTable::default();
        assert_eq!(
            connect_action(&table, Scenario::VoiceCall),
            ConnectAction::LeaveCurrent
        );
    }

    #[test]
    fn test_connect_action_override() {
        let mut table = ScenarioTable::default();
        table.set(Scenario::VoiceCall, AncConfig::Mode(4));
        assert_eq!(
            connect_action(&table, Scenario::VoiceCall),
            ConnectAction::Apply(AncConfig::Mode(4))
        );

        table.set(Scenario::Playback, AncConfig::Off);
        assert_eq!(
            connect_action(&table, Scenario::Playback),
            ConnectAction::Apply(AncConfig::Off)
        );
    }

    #[test]
    fn test_disconnect_prefers_standalone_config() {
        let mut table = ScenarioTable::default();
        assert_eq!(disconnect_action(&table), DisconnectAction::RestorePrevious);

        table.set(Scenario::Standalone, AncConfig::Mode(2));
        assert_eq!(
            disconnect_action(&table),
            DisconnectAction::Apply(AncConfig::Mode(2))
        );
    }
}
