//! Core ANC state machine
//!
//! Owns the session, consumes every inbound event through a single `step`
//! entry point, and drives the signal engine, gain ramps, concurrency
//! arbitration, trigger arbitration and peer mirroring. Asynchronous
//! hardware operations split into a request step and a completion event; a
//! re-entrancy lock with a single deferred slot serializes state-changing
//! requests (the latest deferred request wins).

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::arbiter::{
    connect_action, disconnect_action, ConnectAction, DisconnectAction, OutputUsers, Scenario,
};
use crate::config::{AncProfile, InitError};
use crate::events::{Event, Notification};
use crate::gain::{self, PASSIVE_ISOLATION_GAIN};
use crate::peer::{PeerLink, PeerSnapshot, Role};
use crate::signal::{Ack, MicPool, MicUser, SignalEngine};
use crate::storage::{SessionData, SessionStore};
use crate::trigger::{Arbitration, TriggerKind, TriggerManager};

use super::session::{
    next_toggle_disabled, next_toggle_enabled, AncConfig, Session, WearState, WorldVolumeBalance,
};

/// Sample rate requested for ANC microphone channels.
const ANC_MIC_RATE_HZ: u32 = 16_000;

/// States of the ANC control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncState {
    Uninitialised,
    PowerOff,
    Disabled,
    Enabled,
    TuningActive,
    AdaptiveTuningActive,
}

impl std::fmt::Display for AncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AncState::Uninitialised => write!(f, "Uninitialised"),
            AncState::PowerOff => write!(f, "PowerOff"),
            AncState::Disabled => write!(f, "Disabled"),
            AncState::Enabled => write!(f, "Enabled"),
            AncState::TuningActive => write!(f, "TuningActive"),
            AncState::AdaptiveTuningActive => write!(f, "AdaptiveTuningActive"),
        }
    }
}

/// The operation the re-entrancy lock is currently held for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Enable,
    Disable,
    ModeChange,
}

/// Running timers. Each is a delayed self-message; cancellation aborts the
/// task and is a no-op when nothing is pending.
#[derive(Default)]
struct TimerSet {
    settling: Option<JoinHandle<()>>,
    gentle_mute: Option<JoinHandle<()>>,
    telemetry: Option<JoinHandle<()>>,
}

impl TimerSet {
    fn cancel(slot: &mut Option<JoinHandle<()>>) {
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        Self::cancel(&mut self.settling);
        Self::cancel(&mut self.gentle_mute);
        Self::cancel(&mut self.telemetry);
    }
}

/// The ANC state machine.
pub struct StateMachine<E: SignalEngine> {
    state: AncState,
    session: Session,
    profile: AncProfile,
    engine: E,
    triggers: TriggerManager,
    peer: PeerLink,
    store: Box<dyn SessionStore>,
    mics: Option<Box<dyn MicPool>>,
    /// Channel for notifying registered clients
    notify_tx: broadcast::Sender<Notification>,
    /// Posting half of our own event channel, for delayed self-messages
    self_tx: mpsc::Sender<Event>,
    timers: TimerSet,
    lock: Option<PendingOp>,
    deferred: Option<Event>,
    /// Peer snapshot whose gain/demo/world-volume tail waits for a pending
    /// hardware enable to complete
    pending_snapshot: Option<PeerSnapshot>,
}

impl<E: SignalEngine> StateMachine<E> {
    pub fn new(
        profile: AncProfile,
        engine: E,
        store: Box<dyn SessionStore>,
        peer: PeerLink,
        notify_tx: broadcast::Sender<Notification>,
        self_tx: mpsc::Sender<Event>,
    ) -> Self {
        let session = Session::new(&profile);
        Self {
            state: AncState::Uninitialised,
            session,
            profile,
            engine,
            triggers: TriggerManager::new(),
            peer,
            store,
            mics: None,
            notify_tx,
            self_tx,
            timers: TimerSet::default(),
            lock: None,
            deferred: None,
            pending_snapshot: None,
        }
    }

    pub fn with_mic_pool(mut self, mics: Box<dyn MicPool>) -> Self {
        self.mics = Some(mics);
        self
    }

    pub fn state(&self) -> AncState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn profile(&self) -> &AncProfile {
        &self.profile
    }

    /// One-time startup: validates the profile, restores the persisted
    /// session block according to the boot behaviour, and moves to PowerOff.
    /// A validation failure is fatal and must abort the daemon.
    pub fn initialise(&mut self) -> Result<(), InitError> {
        self.profile.validate()?;

        match self.store.load() {
            Ok(Some(data)) => self.restore_session_block(data),
            Ok(None) => {
                self.session.requested_enabled = self.profile.boot.initial_enabled;
            }
            Err(e) => {
                warn!(?e, "session block unreadable, using boot defaults");
                self.session.requested_enabled = self.profile.boot.initial_enabled;
            }
        }

        self.transition_to(AncState::PowerOff);
        Ok(())
    }

    fn restore_session_block(&mut self, data: SessionData) {
        let boot = self.profile.boot;
        self.session.requested_enabled = if boot.persist_enabled {
            data.enabled
        } else {
            boot.initial_enabled
        };
        if boot.persist_mode && data.mode < self.profile.num_modes() {
            self.session.requested_mode = data.mode;
            self.session.current_mode = data.mode;
        }
        self.session.toggle_cycle = data.toggle_cycle;
        self.session.scenario_table = data.scenario_table;
        if data.world_volume_db.len() == self.session.world_volume_db.len() {
            self.session.world_volume_db = data.world_volume_db;
        }
        self.session.balance = data.balance;
        self.session.noise_id_enabled = data.noise_id_enabled;
        self.session.auto_ambient_enabled = data.auto_ambient_enabled;
        self.session.auto_ambient_release_secs = data.auto_ambient_release_secs;
    }

    /// Run the state machine, processing inbound events.
    pub async fn run(&mut self, mut event_rx: mpsc::Receiver<Event>) {
        info!(state = %self.state, "ANC state machine started");

        while let Some(event) = event_rx.recv().await {
            self.step(event);
        }

        info!("ANC state machine stopped");
    }

    /// Advance the machine by one event.
    pub fn step(&mut self, event: Event) {
        debug!(state = %self.state, ?event, "handling event");

        if self.lock.is_some() && Self::is_request(&event) {
            debug!(?event, "operation in flight, deferring request");
            self.deferred = Some(event);
            return;
        }

        self.dispatch(event);

        if self.lock.is_none() {
            if let Some(deferred) = self.deferred.take() {
                debug!(?deferred, "dispatching deferred request");
                self.step(deferred);
            }
        }
    }

    /// Requests serialized by the re-entrancy lock. Completions, timers and
    /// configuration writes always go through.
    fn is_request(event: &Event) -> bool {
        matches!(
            event,
            Event::Enable
                | Event::Disable
                | Event::SetMode { .. }
                | Event::ToggleWay
                | Event::SetLeakthroughGain { .. }
                | Event::WorldVolumeUp
                | Event::WorldVolumeDown
                | Event::SetWorldVolumeGain { .. }
                | Event::SetWorldVolumeBalance { .. }
                | Event::EnterTuning
                | Event::ExitTuning
                | Event::EnterAdaptiveTuning
                | Event::ExitAdaptiveTuning
                | Event::ScenarioConnected { .. }
                | Event::ScenarioDisconnected { .. }
                | Event::SelfSpeechTriggered
                | Event::SelfSpeechReleased
                | Event::PeerSnapshotReceived { .. }
        )
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            // Configuration and environment bookkeeping, valid in any state.
            Event::SetToggleCycleSlot { slot, config } => self.set_toggle_slot(slot, config),
            Event::SetScenarioConfig { scenario, config } => {
                self.set_scenario_config(scenario, config)
            }
            Event::SetDemoState { active } => self.set_demo_state(active),
            Event::PauseAdaptivity => self.set_adaptivity(false),
            Event::ResumeAdaptivity => self.set_adaptivity(true),
            Event::SetNoiseIdEnabled { enabled } => self.set_noise_id_enabled(enabled),
            Event::SetWindDetectionEnabled { enabled } => self.set_wind_detection(enabled),
            Event::SetHowlingDetectionEnabled { enabled } => self.set_howling_detection(enabled),
            Event::SetAdverseHandlerEnabled { enabled } => self.set_adverse_handler(enabled),
            Event::SetAutoAmbientEnabled { enabled } => {
                self.session.auto_ambient_enabled = enabled;
                self.notify(Notification::AutoAmbientEnabledChanged { enabled });
            }
            Event::SetAutoAmbientReleaseTime { seconds } => {
                self.session.auto_ambient_release_secs = seconds;
                self.notify(Notification::AutoAmbientReleaseTimeChanged { seconds });
            }
            Event::StoreConfiguration => self.store_session_block(),
            Event::WearStateChanged { state } => {
                self.session.wear_state = state;
            }
            Event::PeerWearStateChanged { state } => self.peer_wear_changed(state),
            Event::PeerRoleChanged { role } => self.peer_role_changed(role),
            Event::HowlingChanged { active } => {
                self.notify(Notification::HowlingChanged { active });
            }
            Event::WindDetected => self.wind_detected(),
            Event::WindReleased => self.wind_released(),
            Event::QuietModeDetected => self.quiet_detected(),
            Event::QuietModeCleared => self.quiet_cleared(),
            Event::NoiseCategoryChanged { category } => self.noise_category_changed(category),
            Event::TelemetryTimerFired => self.telemetry_tick(),

            other => match self.state {
                AncState::Uninitialised => {
                    warn!(event = ?other, "event before initialisation, ignored");
                }
                AncState::PowerOff => self.handle_power_off_state(other),
                AncState::Disabled => self.handle_disabled(other),
                AncState::Enabled => self.handle_enabled(other),
                AncState::TuningActive => self.handle_tuning(other, false),
                AncState::AdaptiveTuningActive => self.handle_tuning(other, true),
            },
        }
    }

    // ------------------------------------------------------------------
    // Per-state handlers
    // ------------------------------------------------------------------

    fn handle_power_off_state(&mut self, event: Event) {
        match event {
            Event::PowerOn => self.power_on(),
            other => debug!(event = ?other, "ignored while powered off"),
        }
    }

    fn handle_disabled(&mut self, event: Event) {
        match event {
            Event::PowerOff => self.power_off(),
            Event::Enable => self.request_enable(),
            Event::Disable => debug!("already disabled"),
            Event::SetMode { mode } => self.set_mode_while_disabled(mode),
            Event::ToggleWay => self.handle_toggle_way(),
            Event::SetLeakthroughGain { gain } => self.set_leakthrough_gain(gain),
            Event::WorldVolumeUp => self.step_world_volume(true),
            Event::WorldVolumeDown => self.step_world_volume(false),
            Event::SetWorldVolumeGain { gain_db } => self.set_world_volume(gain_db),
            Event::SetWorldVolumeBalance { balance } => self.set_balance(balance),
            Event::EnterTuning => self.enter_tuning(false),
            Event::EnterAdaptiveTuning => self.enter_tuning(true),
            Event::ScenarioConnected { users } => self.scenario_connected(users),
            Event::ScenarioDisconnected { users } => self.scenario_disconnected(users),
            Event::SelfSpeechTriggered => self.self_speech_triggered(),
            Event::SelfSpeechReleased => self.self_speech_released(),
            Event::PeerSnapshotReceived { snapshot } => self.apply_peer_snapshot(snapshot),
            Event::EnableComplete => {
                if self.lock == Some(PendingOp::Enable) {
                    self.finish_enable();
                } else {
                    debug!("stale enable completion");
                }
            }
            other => debug!(event = ?other, "ignored while disabled"),
        }
    }

    fn handle_enabled(&mut self, event: Event) {
        match event {
            Event::PowerOff => self.power_off(),
            Event::Enable => debug!("already enabled"),
            Event::Disable => self.request_disable(),
            Event::SetMode { mode } => self.request_mode_change(mode),
            Event::ToggleWay => self.handle_toggle_way(),
            Event::SetLeakthroughGain { gain } => self.set_leakthrough_gain(gain),
            Event::WorldVolumeUp => self.step_world_volume(true),
            Event::WorldVolumeDown => self.step_world_volume(false),
            Event::SetWorldVolumeGain { gain_db } => self.set_world_volume(gain_db),
            Event::SetWorldVolumeBalance { balance } => self.set_balance(balance),
            Event::EnterTuning => self.enter_tuning(false),
            Event::EnterAdaptiveTuning => self.enter_tuning(true),
            Event::ScenarioConnected { users } => self.scenario_connected(users),
            Event::ScenarioDisconnected { users } => self.scenario_disconnected(users),
            Event::SelfSpeechTriggered => self.self_speech_triggered(),
            Event::SelfSpeechReleased => self.self_speech_released(),
            Event::PeerSnapshotReceived { snapshot } => self.apply_peer_snapshot(snapshot),
            Event::DisableComplete => {
                if self.lock == Some(PendingOp::Disable) {
                    self.finish_disable();
                } else {
                    debug!("stale disable completion");
                }
            }
            Event::ModeChangeComplete => {
                if self.lock == Some(PendingOp::ModeChange) {
                    self.finish_mode_change();
                } else {
                    debug!("stale mode-change completion");
                }
            }
            Event::SettlingTimerFired => self.settle_gains(),
            Event::GentleMuteTimerFired => self.continue_after_gentle_mute(),
            other => debug!(event = ?other, "ignored while enabled"),
        }
    }

    fn handle_tuning(&mut self, event: Event, adaptive: bool) {
        match event {
            Event::PowerOff => self.power_off(),
            Event::UsbEnumerated => {
                if let Err(e) = self.engine.enter_tuning(adaptive) {
                    warn!(?e, "tuning entry rejected");
                }
            }
            Event::ExitTuning | Event::ExitAdaptiveTuning | Event::UsbDetached => {
                if let Err(e) = self.engine.exit_tuning() {
                    warn!(?e, "tuning exit rejected");
                }
                if adaptive && self.session.actual_enabled {
                    if let Err(e) = self.engine.disable() {
                        warn!(?e, "disable after adaptive tuning failed");
                    }
                    self.session.actual_enabled = false;
                    self.session.requested_enabled = false;
                    self.session.fine_gain = [0, 0];
                    self.release_mics();
                    self.notify(Notification::EnabledChanged { enabled: false });
                }
                self.transition_to(AncState::Disabled);
            }
            other => debug!(event = ?other, "ignored during tuning"),
        }
    }

    // ------------------------------------------------------------------
    // Power
    // ------------------------------------------------------------------

    fn power_on(&mut self) {
        let range = self.profile.world_volume;
        self.notify(Notification::WorldVolumeConfigChanged {
            min_db: range.min_db,
            max_db: range.max_db,
            step_db: range.step_db,
        });

        self.transition_to(AncState::Disabled);
        if self.session.requested_enabled {
            self.request_enable();
        }
    }

    fn power_off(&mut self) {
        self.timers.cancel_all();
        self.lock = None;
        self.deferred = None;
        self.pending_snapshot = None;

        if self.session.actual_enabled {
            if let Err(e) = self.engine.disable() {
                warn!(?e, "disable on power-off failed");
            }
            self.session.actual_enabled = false;
            self.session.fine_gain = [0, 0];
            self.release_mics();
        }

        self.store_session_block();
        self.transition_to(AncState::PowerOff);
    }

    fn store_session_block(&mut self) {
        if let Err(e) = self.store.save(&SessionData::capture(&self.session)) {
            warn!(?e, "failed to persist session block");
        }
    }

    // ------------------------------------------------------------------
    // Enable / disable
    // ------------------------------------------------------------------

    fn request_enable(&mut self) {
        if self.session.actual_enabled {
            debug!("enable requested but already enabled");
            self.session.requested_enabled = true;
            return;
        }
        if self.lock.is_some() {
            debug!("operation in flight, enable skipped");
            return;
        }

        self.session.requested_enabled = true;
        let mode = self.session.requested_mode;
        let adaptive = self.is_adaptive(mode);
        self.acquire_mics();

        self.lock = Some(PendingOp::Enable);
        match self.engine.enable(mode, adaptive) {
            Ok(Ack::Done) => self.finish_enable(),
            Ok(Ack::Pending) => debug!(mode, "enable pending hardware completion"),
            Err(e) => {
                warn!(?e, mode, "enable rejected");
                self.session.requested_enabled = false;
                self.lock = None;
                self.release_mics();
                self.drain_pending_snapshot();
            }
        }
    }

    fn finish_enable(&mut self) {
        self.session.actual_enabled = true;
        self.session.current_mode = self.session.requested_mode;
        self.lock = None;
        self.transition_to(AncState::Enabled);
        self.notify(Notification::EnabledChanged { enabled: true });

        self.apply_engine_config_for_mode();
        if !self.is_adaptive(self.session.current_mode) {
            self.start_settling_timer();
        }
        self.restart_telemetry();

        self.drain_pending_snapshot();
        self.peer.publish_snapshot(&self.session);
    }

    /// A snapshot tail parked behind a pending operation is applied as soon
    /// as the lock clears, whichever operation held it.
    fn drain_pending_snapshot(&mut self) {
        if let Some(snapshot) = self.pending_snapshot.take() {
            self.apply_snapshot_tail(&snapshot);
        }
    }

    fn request_disable(&mut self) {
        if !self.session.actual_enabled {
            debug!("disable requested but already disabled");
            self.session.requested_enabled = false;
            return;
        }
        if self.lock.is_some() {
            debug!("operation in flight, disable skipped");
            return;
        }

        self.session.requested_enabled = false;
        TimerSet::cancel(&mut self.timers.settling);

        // A deliberate system disable (scenario override, restore of an Off
        // previous config) must not be misread as the user's mode choice.
        if self.session.system_triggered_disable {
            self.session.system_triggered_disable = false;
        } else if self.session.may_stamp_previous() {
            let mode = AncConfig::from_mode_index(self.session.requested_mode);
            self.session.previous_mode = mode;
            self.notify(Notification::PreviousModeChanged { mode });
        }

        self.lock = Some(PendingOp::Disable);
        if self.is_adaptive(self.session.current_mode) {
            if let Err(e) = self.engine.gentle_mute() {
                warn!(?e, "gentle mute failed");
            }
            self.start_gentle_mute_timer();
        } else {
            self.run_ramp_down(0);
            self.complete_disable_request();
        }
    }

    /// Hardware teardown; runs after the gentle mute settles for adaptive
    /// modes or immediately after the ramp-down for static ones.
    fn complete_disable_request(&mut self) {
        match self.engine.disable() {
            Ok(Ack::Done) => self.finish_disable(),
            Ok(Ack::Pending) => debug!("disable pending hardware completion"),
            Err(e) => {
                warn!(?e, "disable rejected");
                self.session.requested_enabled = true;
                self.lock = None;
                self.drain_pending_snapshot();
            }
        }
    }

    fn finish_disable(&mut self) {
        self.session.actual_enabled = false;
        self.session.fine_gain = [0, 0];
        self.lock = None;
        self.timers.cancel_all();
        self.release_mics();
        self.transition_to(AncState::Disabled);
        self.notify(Notification::EnabledChanged { enabled: false });
        self.drain_pending_snapshot();
        self.peer.publish_snapshot(&self.session);
    }

    // ------------------------------------------------------------------
    // Mode changes
    // ------------------------------------------------------------------

    fn set_mode_while_disabled(&mut self, mode: u8) {
        if mode >= self.profile.num_modes() {
            warn!(mode, num_modes = self.profile.num_modes(), "mode out of range, ignored");
            return;
        }
        if mode == self.session.requested_mode {
            return;
        }
        self.session.requested_mode = mode;
        self.session.current_mode = mode;
        self.notify(Notification::ModeChanged { mode });
        self.peer.publish_snapshot(&self.session);
    }

    fn request_mode_change(&mut self, mode: u8) {
        if mode >= self.profile.num_modes() {
            warn!(mode, num_modes = self.profile.num_modes(), "mode out of range, ignored");
            return;
        }
        if !self.session.actual_enabled {
            self.set_mode_while_disabled(mode);
            return;
        }
        if mode == self.session.current_mode {
            debug!(mode, "already in requested mode");
            return;
        }
        if self.lock.is_some() {
            debug!("operation in flight, mode change skipped");
            return;
        }

        TimerSet::cancel(&mut self.timers.settling);
        self.session.requested_mode = mode;
        self.lock = Some(PendingOp::ModeChange);

        let from_adaptive = self.is_adaptive(self.session.current_mode);
        let to_adaptive = self.is_adaptive(mode);

        if from_adaptive && to_adaptive && self.profile.fast_mode_switch {
            // Filter coefficients swap without an intervening mute.
            match self.engine.set_mode(mode, true, true) {
                Ok(Ack::Done) => self.finish_mode_change(),
                Ok(Ack::Pending) => {}
                Err(e) => self.rollback_mode_change(e),
            }
        } else if from_adaptive {
            if let Err(e) = self.engine.gentle_mute() {
                warn!(?e, "gentle mute failed");
            }
            self.start_gentle_mute_timer();
        } else {
            self.run_ramp_down(0);
            self.issue_mode_switch();
        }
    }

    fn issue_mode_switch(&mut self) {
        let mode = self.session.requested_mode;
        let adaptive = self.is_adaptive(mode);
        match self.engine.set_mode(mode, adaptive, false) {
            Ok(Ack::Done) => self.finish_mode_change(),
            Ok(Ack::Pending) => debug!(mode, "mode switch pending hardware completion"),
            Err(e) => self.rollback_mode_change(e),
        }
    }

    fn rollback_mode_change(&mut self, e: crate::signal::EngineError) {
        warn!(
            ?e,
            requested = self.session.requested_mode,
            current = self.session.current_mode,
            "mode set rejected, rolling back"
        );
        self.session.requested_mode = self.session.current_mode;
        self.lock = None;
        // Gains were torn down in preparation; bring them back for the mode
        // we stayed in.
        if !self.is_adaptive(self.session.current_mode) {
            self.start_settling_timer();
        }
        self.drain_pending_snapshot();
    }

    fn finish_mode_change(&mut self) {
        let mode = self.session.requested_mode;
        self.session.current_mode = mode;
        self.lock = None;
        self.notify(Notification::ModeChanged { mode });

        self.apply_engine_config_for_mode();
        if !self.is_adaptive(mode) {
            self.start_settling_timer();
        }
        if self.session.noise_id_enabled && !self.mode_supports_noise_id(mode) {
            self.notify(Notification::NoiseCategoryNotApplicable { mode });
        }
        self.restart_telemetry();
        self.drain_pending_snapshot();
        self.peer.publish_snapshot(&self.session);
    }

    fn continue_after_gentle_mute(&mut self) {
        match self.lock {
            Some(PendingOp::Disable) => self.complete_disable_request(),
            Some(PendingOp::ModeChange) => self.issue_mode_switch(),
            _ => debug!("stale gentle-mute expiry"),
        }
    }

    // ------------------------------------------------------------------
    // Gain
    // ------------------------------------------------------------------

    /// Target fine gains for a mode: the user-adjusted leakthrough gain if
    /// one was preserved, otherwise the profile defaults.
    fn gain_targets(&self, mode: u8) -> [u8; 2] {
        let profile_mode = &self.profile.modes[mode as usize];
        let targets = match self.session.leakthrough_gain[mode as usize] {
            Some(gain) if profile_mode.passes_world() => [gain, gain],
            _ => profile_mode.fine_gain,
        };
        if self.profile.dual_instance {
            targets
        } else {
            [targets[0], targets[0]]
        }
    }

    /// Reapply gains once the hardware has settled after an enable or a
    /// mode switch. Adaptive modes manage their own fine gain.
    fn settle_gains(&mut self) {
        if !self.session.actual_enabled || self.is_adaptive(self.session.current_mode) {
            return;
        }
        let targets = self.gain_targets(self.session.current_mode);
        let from = self.session.fine_gain[0].min(self.session.fine_gain[1]);
        let plan = gain::ramp_up_plan(from, targets);
        self.run_plan(&plan);
        self.session.fine_gain = targets;
        self.notify(Notification::FineGainChanged { left: targets[0], right: targets[1] });
    }

    fn run_ramp_down(&mut self, to: u8) {
        let plan = gain::ramp_down_plan(self.session.fine_gain, to);
        self.run_plan(&plan);
        self.session.fine_gain = [to, to];
    }

    fn run_plan(&mut self, plan: &[gain::GainStep]) {
        for step in plan {
            if let Err(e) = self.engine.write_fine_gain(step.instances, step.gain) {
                warn!(?e, ?step, "fine gain write failed, abandoning ramp");
                break;
            }
        }
    }

    fn set_leakthrough_gain(&mut self, gain: u8) {
        let mode = self.session.requested_mode;
        let Some(profile_mode) = self.profile.mode(mode) else {
            return;
        };
        if !profile_mode.passes_world() {
            warn!(mode, "leakthrough gain on a non-leakthrough mode, ignored");
            return;
        }

        self.session.leakthrough_gain[mode as usize] = Some(gain);
        if self.session.actual_enabled
            && self.session.current_mode == mode
            && !self.is_adaptive(mode)
        {
            let current = self.session.fine_gain;
            let plan = if current[0] == current[1] {
                if gain >= current[0] {
                    gain::ramp_up_plan(current[0], [gain, gain])
                } else {
                    gain::ramp_down_plan(current, gain)
                }
            } else {
                // Unequal instance gains: each instance ramps from its own
                // level so neither side jumps away from its target.
                let mut plan = Vec::new();
                for (from, instances) in
                    [(current[0], gain::Instances::Left), (current[1], gain::Instances::Right)]
                {
                    let values = if gain >= from {
                        gain::ramp_up_values(from, gain)
                    } else {
                        gain::ramp_down_values(from, gain)
                    };
                    plan.extend(
                        values.into_iter().map(|gain| gain::GainStep { instances, gain }),
                    );
                }
                plan
            };
            self.run_plan(&plan);
            self.session.fine_gain = [gain, gain];
            self.notify(Notification::FineGainChanged { left: gain, right: gain });
        }
        self.notify(Notification::LeakthroughGainChanged { gain });
        self.peer.publish_snapshot(&self.session);
    }

    // ------------------------------------------------------------------
    // Toggle way
    // ------------------------------------------------------------------

    fn handle_toggle_way(&mut self) {
        let num_modes = self.profile.num_modes();
        let next = if self.session.actual_enabled {
            next_toggle_enabled(&self.session.toggle_cycle, self.session.current_mode, num_modes)
        } else {
            next_toggle_disabled(&self.session.toggle_cycle, self.session.previous_config, num_modes)
        };

        match next {
            AncConfig::Unset => {
                warn!("toggle cycle unconfigured, ignoring toggle");
            }
            config if config == AncConfig::Off || config.is_valid_mode(num_modes) => {
                self.session.previous_config = config;
                self.notify(Notification::PreviousConfigChanged { config });
                self.apply_config(config);
            }
            config => {
                warn!(?config, "toggle cycle names an invalid mode, ignoring toggle");
            }
        }
    }

    /// Apply a user- or cycle-chosen configuration.
    fn apply_config(&mut self, config: AncConfig) {
        match config {
            AncConfig::Off => {
                if self.session.actual_enabled {
                    self.request_disable();
                }
            }
            AncConfig::Mode(_) => {
                if let Some(mode) = config.mode_index() {
                    if self.session.actual_enabled {
                        self.request_mode_change(mode);
                    } else {
                        self.session.requested_mode = mode;
                        self.request_enable();
                    }
                }
            }
            AncConfig::Unset => {}
        }
    }

    /// Apply a configuration chosen by concurrency or restoration, subject
    /// to the Noise-ID redundancy check and flagged as system-triggered
    /// where it disables.
    fn apply_config_checked(&mut self, config: AncConfig) {
        match config {
            AncConfig::Off => {
                if self.session.actual_enabled {
                    self.session.system_triggered_disable = true;
                    self.request_disable();
                }
            }
            AncConfig::Mode(_) => {
                let Some(mode) = config.mode_index() else { return };
                if mode >= self.profile.num_modes() {
                    warn!(mode, "override names an invalid mode, ignored");
                    return;
                }
                if self.session.actual_enabled {
                    // When both modes classify noise themselves the switch
                    // would only cause category churn.
                    if self.mode_supports_noise_id(self.session.current_mode)
                        && self.mode_supports_noise_id(mode)
                    {
                        debug!(
                            current = self.session.current_mode,
                            target = mode,
                            "both modes support Noise-ID, skipping switch"
                        );
                        return;
                    }
                    self.request_mode_change(mode);
                } else {
                    self.session.requested_mode = mode;
                    self.request_enable();
                }
            }
            AncConfig::Unset => {}
        }
    }

    // ------------------------------------------------------------------
    // Concurrency
    // ------------------------------------------------------------------

    fn scenario_connected(&mut self, users: OutputUsers) {
        if self.session.wear_state != WearState::InEar {
            debug!("not worn, scenario connect ignored");
            return;
        }
        let scenario = Scenario::from_users(&users);
        if scenario.is_standalone() {
            self.scenario_disconnected(users);
            return;
        }

        if self.session.self_speech_active {
            debug!(?scenario, "self-speech in progress, concurrency action deferred");
            self.session.concurrency_active = true;
            self.session.active_scenario = Some(scenario);
            return;
        }

        if self.session.may_stamp_previous() {
            self.stamp_previous();
        }
        self.session.concurrency_active = true;
        self.session.active_scenario = Some(scenario);

        match connect_action(&self.session.scenario_table, scenario) {
            ConnectAction::LeaveCurrent => {
                debug!(?scenario, "scenario has no override");
            }
            ConnectAction::Apply(config) => self.apply_config_checked(config),
        }
    }

    fn scenario_disconnected(&mut self, remaining: OutputUsers) {
        let scenario = Scenario::from_users(&remaining);
        if !scenario.is_standalone() {
            // Another consumer keeps the device in concurrency; switch
            // overrides without re-stamping the previous state.
            self.session.active_scenario = Some(scenario);
            if !self.session.self_speech_active {
                if let ConnectAction::Apply(config) =
                    connect_action(&self.session.scenario_table, scenario)
                {
                    self.apply_config_checked(config);
                }
            }
            return;
        }

        if !self.session.concurrency_active {
            debug!("scenario disconnect without active concurrency");
            return;
        }
        self.session.concurrency_active = false;
        self.session.active_scenario = None;

        if self.session.self_speech_active {
            debug!("self-speech in progress, restore deferred to its release");
            return;
        }

        match disconnect_action(&self.session.scenario_table) {
            DisconnectAction::Apply(config) => self.apply_config_checked(config),
            DisconnectAction::RestorePrevious => self.restore_previous(),
        }
    }

    fn stamp_previous(&mut self) {
        let (config, mode) = self.session.derive_previous();
        self.session.previous_config = config;
        self.session.previous_mode = mode;
        self.notify(Notification::PreviousConfigChanged { config });
        self.notify(Notification::PreviousModeChanged { mode });
    }

    fn restore_previous(&mut self) {
        match self.session.previous_config {
            AncConfig::Off => {
                if self.session.actual_enabled {
                    self.session.system_triggered_disable = true;
                    self.request_disable();
                }
            }
            config @ AncConfig::Mode(_) => self.apply_config_checked(config),
            AncConfig::Unset => debug!("no previous configuration to restore"),
        }
    }

    // ------------------------------------------------------------------
    // Self-speech (auto-ambient)
    // ------------------------------------------------------------------

    fn self_speech_triggered(&mut self) {
        if !self.session.auto_ambient_enabled {
            debug!("auto-ambient disabled, self-speech ignored");
            return;
        }
        let Some(ambient) = self.profile.ambient_mode else {
            debug!("no ambient mode fitted, self-speech ignored");
            return;
        };
        if self.session.self_speech_active {
            return;
        }
        if matches!(
            self.session.active_scenario,
            Some(Scenario::VoiceCall | Scenario::VoiceAssistant | Scenario::StereoRecording)
        ) {
            debug!("active scenario blocks auto-ambient");
            return;
        }

        if self.session.may_stamp_previous() {
            self.stamp_previous();
        }
        self.session.self_speech_active = true;

        if self.session.actual_enabled {
            if self.session.current_mode != ambient {
                self.request_mode_change(ambient);
            }
        } else {
            self.session.requested_mode = ambient;
            self.request_enable();
        }
    }

    fn self_speech_released(&mut self) {
        if !self.session.self_speech_active {
            return;
        }
        self.session.self_speech_active = false;

        if self.session.concurrency_active {
            // Concurrency arrived during self-speech; its override applies
            // now that the ambient hold is gone.
            match self
                .session
                .active_scenario
                .map(|s| connect_action(&self.session.scenario_table, s))
            {
                Some(ConnectAction::Apply(config)) => self.apply_config_checked(config),
                _ => self.restore_previous(),
            }
        } else {
            self.restore_previous();
        }
    }

    // ------------------------------------------------------------------
    // Triggers: wind, quiet mode, noise category
    // ------------------------------------------------------------------

    fn wind_detected(&mut self) {
        self.triggers.engage(TriggerKind::DisturbanceAttack);
        self.notify(Notification::WindDetectionChanged { detected: true });

        // Wind wins over a quiet-mode hold.
        if self.session.quiet_mode_engaged {
            self.engage_quiet(false);
        }
    }

    fn wind_released(&mut self) {
        self.notify(Notification::WindDetectionChanged { detected: false });
        let freed = self.triggers.release(TriggerKind::DisturbanceAttack);
        self.resync_freed(&freed);
    }

    fn quiet_detected(&mut self) {
        self.session.quiet_mode_detected = true;
        match self.triggers.arbitrate(TriggerKind::QuietEnable) {
            Arbitration::Proceed => self.engage_quiet(true),
            Arbitration::SuppressedBy(_) => {}
        }
    }

    fn quiet_cleared(&mut self) {
        self.session.quiet_mode_detected = false;
        self.engage_quiet(false);
        let freed = self.triggers.release(TriggerKind::QuietEnable);
        self.resync_freed(&freed);
    }

    fn engage_quiet(&mut self, engaged: bool) {
        if self.session.quiet_mode_engaged == engaged {
            return;
        }
        if engaged && !self.session.actual_enabled {
            return;
        }
        if let Err(e) = self.engine.set_quiet_mode(engaged) {
            warn!(?e, engaged, "quiet mode request rejected");
            return;
        }
        self.session.quiet_mode_engaged = engaged;
        if engaged {
            self.triggers.engage(TriggerKind::QuietEnable);
        }
        self.notify(Notification::QuietModeChanged {
            detected: self.session.quiet_mode_detected,
            engaged,
        });
    }

    fn resync_freed(&mut self, freed: &[TriggerKind]) {
        for kind in freed {
            match kind {
                TriggerKind::QuietEnable => {
                    if self.session.quiet_mode_detected {
                        self.engage_quiet(true);
                    }
                }
                TriggerKind::NoiseCategory => self.resync_noise_category(),
                TriggerKind::DisturbanceAttack => {}
            }
        }
    }

    fn noise_category_changed(&mut self, category: u8) {
        self.session.noise_category = Some(category);
        self.notify(Notification::NoiseCategoryChanged { category });

        if !self.session.noise_id_enabled {
            return;
        }
        // Suppression by wind or quiet mode is cooperative, not an error;
        // the release path resynchronizes.
        if self.triggers.arbitrate(TriggerKind::NoiseCategory) != Arbitration::Proceed {
            return;
        }
        self.apply_noise_category(category);
    }

    fn apply_noise_category(&mut self, category: u8) {
        let Some(mode) = self
            .profile
            .noise_id_mode_for_category
            .get(category as usize)
            .copied()
        else {
            warn!(category, "unmapped noise category");
            return;
        };
        if !self.session.actual_enabled {
            return;
        }
        if !self.mode_supports_noise_id(self.session.current_mode) {
            self.notify(Notification::NoiseCategoryNotApplicable {
                mode: self.session.current_mode,
            });
            return;
        }
        if mode != self.session.current_mode {
            self.request_mode_change(mode);
        }
    }

    fn resync_noise_category(&mut self) {
        if !self.session.noise_id_enabled {
            return;
        }
        if let Some(category) = self.session.noise_category {
            self.apply_noise_category(category);
        }
    }

    fn mode_supports_noise_id(&self, mode: u8) -> bool {
        self.profile.mode(mode).map(|m| m.noise_id).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // World volume
    // ------------------------------------------------------------------

    fn set_world_volume(&mut self, gain_db: i8) {
        let range = self.profile.world_volume;
        if gain_db < range.min_db || gain_db > range.max_db {
            warn!(gain_db, range.min_db, range.max_db, "world-volume gain out of range, ignored");
            return;
        }
        let mode = self.session.requested_mode;
        if self.session.world_volume_db[mode as usize] == gain_db {
            return;
        }

        if self.session.actual_enabled && self.mode_passes_world(self.session.current_mode) {
            if let Err(e) = self.engine.set_world_volume(gain_db) {
                warn!(?e, gain_db, "world-volume apply rejected");
                return;
            }
        }
        self.session.world_volume_db[mode as usize] = gain_db;
        self.notify(Notification::WorldVolumeGainChanged { mode, gain_db });
        self.peer.publish_snapshot(&self.session);
    }

    fn step_world_volume(&mut self, up: bool) {
        let range = self.profile.world_volume;
        let current = self.session.world_volume_db[self.session.requested_mode as usize];
        let step = if up { range.step_db as i16 } else { -(range.step_db as i16) };
        let next = (current as i16 + step).clamp(range.min_db as i16, range.max_db as i16) as i8;
        if next != current {
            self.set_world_volume(next);
        }
    }

    fn set_balance(&mut self, balance: WorldVolumeBalance) {
        let balance = WorldVolumeBalance {
            side: balance.side,
            percentage: balance.percentage.min(100),
        };
        if self.session.actual_enabled && self.mode_passes_world(self.session.current_mode) {
            if let Err(e) = self.engine.set_world_volume_balance(&balance) {
                warn!(?e, "balance apply rejected");
                return;
            }
        }
        self.session.balance = balance;
        self.notify(Notification::WorldVolumeBalanceChanged { balance });
        self.peer.publish_snapshot(&self.session);
    }

    fn mode_passes_world(&self, mode: u8) -> bool {
        self.profile.mode(mode).map(|m| m.passes_world()).unwrap_or(false)
    }

    /// Coarse gain plus, for world-passing modes, the stored world volume
    /// and balance; runs on every enable and mode switch.
    fn apply_engine_config_for_mode(&mut self) {
        let mode = self.session.current_mode;
        if let Err(e) = self.engine.apply_coarse_gain(mode) {
            warn!(?e, mode, "coarse gain apply failed");
        }
        if self.mode_passes_world(mode) {
            let gain_db = self.session.world_volume_db[mode as usize];
            if let Err(e) = self.engine.set_world_volume(gain_db) {
                warn!(?e, "world-volume apply failed");
            }
            let balance = self.session.balance;
            if let Err(e) = self.engine.set_world_volume_balance(&balance) {
                warn!(?e, "balance apply failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Tuning
    // ------------------------------------------------------------------

    fn enter_tuning(&mut self, adaptive: bool) {
        self.timers.cancel_all();
        self.lock = None;

        if adaptive {
            // Adaptive tuning drives the live processing path, so the
            // hardware must be running for the whole session.
            if !self.session.actual_enabled {
                self.acquire_mics();
                match self.engine.enable(self.session.requested_mode, true) {
                    Ok(_) => {
                        self.session.actual_enabled = true;
                        self.session.current_mode = self.session.requested_mode;
                    }
                    Err(e) => {
                        warn!(?e, "hardware enable for adaptive tuning failed");
                        self.release_mics();
                    }
                }
            }
            self.transition_to(AncState::AdaptiveTuningActive);
            return;
        }

        if self.session.actual_enabled {
            if self.is_adaptive(self.session.current_mode) {
                if let Err(e) = self.engine.gentle_mute() {
                    warn!(?e, "gentle mute before tuning failed");
                }
            } else {
                self.run_ramp_down(0);
            }
            if let Err(e) = self.engine.disable() {
                warn!(?e, "disable before tuning failed");
            }
            self.session.actual_enabled = false;
            self.session.requested_enabled = false;
            self.session.fine_gain = [0, 0];
            self.release_mics();
            self.notify(Notification::EnabledChanged { enabled: false });
        }

        self.transition_to(AncState::TuningActive);
    }

    // ------------------------------------------------------------------
    // Telemetry and peer
    // ------------------------------------------------------------------

    fn set_demo_state(&mut self, active: bool) {
        if self.session.demo_active == active {
            return;
        }
        self.session.demo_active = active;
        self.notify(Notification::DemoStateChanged { active });
        self.restart_telemetry();
        self.peer.publish_snapshot(&self.session);
    }

    fn telemetry_should_run(&self) -> bool {
        self.session.demo_active && self.session.actual_enabled
    }

    fn restart_telemetry(&mut self) {
        TimerSet::cancel(&mut self.timers.telemetry);
        if self.telemetry_should_run() {
            self.timers.telemetry =
                Some(self.start_timer(Event::TelemetryTimerFired, self.profile.timers.telemetry_ms));
        }
    }

    fn telemetry_tick(&mut self) {
        if !self.telemetry_should_run() {
            debug!("stale telemetry tick");
            return;
        }
        match (self.engine.read_ff_gain(), self.engine.read_fb_gain()) {
            (Ok(ff), Ok(fb)) => {
                self.session.ff_gain = ff;
                self.session.fb_gain = fb;
                self.notify(Notification::FfGainReport { gain: ff });
                self.notify(Notification::FbGainReport { gain: fb });
                self.peer.publish_gain(ff, fb);
            }
            (ff, fb) => {
                warn!(ff_err = ff.is_err(), fb_err = fb.is_err(), "gain read failed");
            }
        }
        // Timer restarts itself.
        self.restart_telemetry();
    }

    fn peer_wear_changed(&mut self, state: WearState) {
        self.session.peer_wear_state = state;
        // A stowed peer has no active path; report its passive isolation
        // immediately rather than waiting for the telemetry period.
        if state == WearState::InCase && self.session.demo_active {
            self.notify(Notification::FfGainReport { gain: PASSIVE_ISOLATION_GAIN });
        }
    }

    fn peer_role_changed(&mut self, role: Role) {
        info!(?role, "peer role changed");
        self.peer.set_role(role);
    }

    /// Phase one of snapshot application: configuration fields, then mode,
    /// then the enabled state through the normal asynchronous path. The
    /// remaining fields wait for any pending hardware enable.
    fn apply_peer_snapshot(&mut self, snapshot: PeerSnapshot) {
        info!("applying peer snapshot");

        for slot in 0..self.session.toggle_cycle.len() {
            if self.session.toggle_cycle[slot] != snapshot.toggle_cycle[slot] {
                self.session.toggle_cycle[slot] = snapshot.toggle_cycle[slot];
                self.notify(Notification::ToggleCycleChanged {
                    slot: slot as u8,
                    config: snapshot.toggle_cycle[slot],
                });
            }
        }
        for scenario in [
            Scenario::Standalone,
            Scenario::Playback,
            Scenario::VoiceCall,
            Scenario::VoiceAssistant,
            Scenario::StereoRecording,
        ] {
            let config = snapshot.scenario_table.get(scenario);
            if self.session.scenario_table.get(scenario) != config {
                self.session.scenario_table.set(scenario, config);
                self.notify(Notification::ScenarioConfigChanged { scenario, config });
            }
        }
        if self.session.previous_config != snapshot.previous_config {
            self.session.previous_config = snapshot.previous_config;
            self.notify(Notification::PreviousConfigChanged { config: snapshot.previous_config });
        }
        if self.session.previous_mode != snapshot.previous_mode {
            self.session.previous_mode = snapshot.previous_mode;
            self.notify(Notification::PreviousModeChanged { mode: snapshot.previous_mode });
        }
        if snapshot.leakthrough_gain.len() == self.session.leakthrough_gain.len() {
            self.session.leakthrough_gain = snapshot.leakthrough_gain.clone();
        }
        if self.session.noise_id_enabled != snapshot.noise_id_enabled {
            self.session.noise_id_enabled = snapshot.noise_id_enabled;
            self.notify(Notification::NoiseIdEnabledChanged { enabled: snapshot.noise_id_enabled });
        }

        if snapshot.mode < self.profile.num_modes() && snapshot.mode != self.session.requested_mode
        {
            if self.session.actual_enabled {
                self.request_mode_change(snapshot.mode);
            } else {
                self.set_mode_while_disabled(snapshot.mode);
            }
        }

        if snapshot.enabled != self.session.requested_enabled {
            if snapshot.enabled {
                self.request_enable();
            } else {
                self.request_disable();
            }
        }

        if self.lock.is_some() {
            self.pending_snapshot = Some(snapshot);
        } else {
            self.apply_snapshot_tail(&snapshot);
        }
    }

    /// Phase two: fields that must not touch hardware until the enable path
    /// has fully completed.
    fn apply_snapshot_tail(&mut self, snapshot: &PeerSnapshot) {
        if self.session.demo_active != snapshot.demo_active {
            self.session.demo_active = snapshot.demo_active;
            self.notify(Notification::DemoStateChanged { active: snapshot.demo_active });
        }
        if self.session.adaptivity_enabled != snapshot.adaptivity_enabled {
            self.set_adaptivity(snapshot.adaptivity_enabled);
        }
        if snapshot.world_volume_db.len() == self.session.world_volume_db.len() {
            for (mode, gain_db) in snapshot.world_volume_db.iter().enumerate() {
                if self.session.world_volume_db[mode] != *gain_db {
                    self.session.world_volume_db[mode] = *gain_db;
                    self.notify(Notification::WorldVolumeGainChanged {
                        mode: mode as u8,
                        gain_db: *gain_db,
                    });
                }
            }
        }
        if self.session.balance != snapshot.balance {
            self.set_balance(snapshot.balance);
        }
        if self.session.actual_enabled && self.mode_passes_world(self.session.current_mode) {
            let gain_db = self.session.world_volume_db[self.session.current_mode as usize];
            if let Err(e) = self.engine.set_world_volume(gain_db) {
                warn!(?e, "world-volume apply from snapshot failed");
            }
        }
        self.restart_telemetry();
    }

    // ------------------------------------------------------------------
    // Feature switches
    // ------------------------------------------------------------------

    fn set_adaptivity(&mut self, enabled: bool) {
        if self.session.adaptivity_enabled == enabled {
            return;
        }
        if self.session.actual_enabled && self.is_adaptive(self.session.current_mode) {
            if let Err(e) = self.engine.set_adaptivity(enabled) {
                warn!(?e, enabled, "adaptivity request rejected");
                return;
            }
        }
        self.session.adaptivity_enabled = enabled;
        self.notify(if enabled {
            Notification::AdaptivityResumed
        } else {
            Notification::AdaptivityPaused
        });
        // Pausing or resuming adaptivity re-evaluates the gain reporting
        // period alongside the demo and enable conditions.
        self.restart_telemetry();
    }

    fn set_noise_id_enabled(&mut self, enabled: bool) {
        if self.session.noise_id_enabled == enabled {
            return;
        }
        self.session.noise_id_enabled = enabled;
        self.notify(Notification::NoiseIdEnabledChanged { enabled });
        if enabled {
            self.resync_noise_category();
        }
    }

    fn set_wind_detection(&mut self, enabled: bool) {
        if let Err(e) = self.engine.set_wind_detection(enabled) {
            warn!(?e, enabled, "wind detection switch rejected");
            return;
        }
        self.session.wind_detection_enabled = enabled;
        self.notify(Notification::WindDetectionEnabledChanged { enabled });
    }

    fn set_howling_detection(&mut self, enabled: bool) {
        if let Err(e) = self.engine.set_howling_detection(enabled) {
            warn!(?e, enabled, "howling detection switch rejected");
            return;
        }
        self.session.howling_detection_enabled = enabled;
        self.notify(Notification::HowlingDetectionEnabledChanged { enabled });
    }

    fn set_adverse_handler(&mut self, enabled: bool) {
        if let Err(e) = self.engine.set_adverse_handler(enabled) {
            warn!(?e, enabled, "adverse handler switch rejected");
            return;
        }
        self.session.adverse_handler_enabled = enabled;
        self.notify(Notification::AdverseHandlerEnabledChanged { enabled });
    }

    fn set_toggle_slot(&mut self, slot: u8, config: AncConfig) {
        if slot as usize >= self.session.toggle_cycle.len() {
            warn!(slot, "toggle slot out of range, ignored");
            return;
        }
        if config != AncConfig::Off
            && config != AncConfig::Unset
            && !config.is_valid_mode(self.profile.num_modes())
        {
            warn!(?config, slot, "invalid toggle configuration, ignored");
            return;
        }
        self.session.toggle_cycle[slot as usize] = config;
        self.notify(Notification::ToggleCycleChanged { slot, config });
        self.peer.publish_snapshot(&self.session);
    }

    fn set_scenario_config(&mut self, scenario: Scenario, config: AncConfig) {
        if config != AncConfig::Off
            && config != AncConfig::Unset
            && !config.is_valid_mode(self.profile.num_modes())
        {
            warn!(?config, ?scenario, "invalid scenario configuration, ignored");
            return;
        }
        self.session.scenario_table.set(scenario, config);
        self.notify(Notification::ScenarioConfigChanged { scenario, config });
        self.peer.publish_snapshot(&self.session);
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn is_adaptive(&self, mode: u8) -> bool {
        self.profile.mode(mode).map(|m| m.is_adaptive()).unwrap_or(false)
    }

    fn acquire_mics(&mut self) {
        let mic = self.profile.mic.clone();
        let Some(pool) = self.mics.as_mut() else { return };
        if let Err(e) = pool.acquire(mic.feed_forward_left, MicUser::AncFeedForward, ANC_MIC_RATE_HZ)
        {
            warn!(?e, "feed-forward mic unavailable");
        }
        if let Some(right) = mic.feed_forward_right {
            if let Err(e) = pool.acquire(right, MicUser::AncFeedForward, ANC_MIC_RATE_HZ) {
                warn!(?e, "feed-forward mic unavailable");
            }
        }
        if let Some(internal) = mic.internal {
            if let Err(e) = pool.acquire(internal, MicUser::AncFeedBack, ANC_MIC_RATE_HZ) {
                warn!(?e, "feed-back mic unavailable");
            }
        }
    }

    fn release_mics(&mut self) {
        let mic = self.profile.mic.clone();
        let Some(pool) = self.mics.as_mut() else { return };
        pool.release(mic.feed_forward_left, MicUser::AncFeedForward);
        if let Some(right) = mic.feed_forward_right {
            pool.release(right, MicUser::AncFeedForward);
        }
        if let Some(internal) = mic.internal {
            pool.release(internal, MicUser::AncFeedBack);
        }
    }

    fn start_settling_timer(&mut self) {
        TimerSet::cancel(&mut self.timers.settling);
        self.timers.settling =
            Some(self.start_timer(Event::SettlingTimerFired, self.profile.timers.settling_ms));
    }

    fn start_gentle_mute_timer(&mut self) {
        TimerSet::cancel(&mut self.timers.gentle_mute);
        self.timers.gentle_mute =
            Some(self.start_timer(Event::GentleMuteTimerFired, self.profile.timers.gentle_mute_ms));
    }

    fn start_timer(&self, event: Event, ms: u64) -> JoinHandle<()> {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let _ = tx.send(event).await;
        })
    }

    fn transition_to(&mut self, new_state: AncState) {
        if new_state == self.state {
            return;
        }
        info!(from = %self.state, to = %new_state, "state transition");
        self.state = new_state;
    }

    fn notify(&self, notification: Notification) {
        debug!(?notification, "notifying clients");
        let _ = self.notify_tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcousticFunction, AncProfile, ModeProfile, ProcessingFamily};
    use crate::gain::Instances;
    use crate::signal::EngineError;
    use crate::storage::NullSessionStore;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct TestEngineState {
        gain_writes: Vec<(Instances, u8)>,
        enabled: bool,
        mode: u8,
        reject_set_mode: bool,
        reject_enable: bool,
        ff_gain: u8,
        fb_gain: u8,
    }

    #[derive(Clone, Default)]
    struct TestEngine {
        state: Arc<Mutex<TestEngineState>>,
    }

    impl TestEngine {
        fn gains(&self) -> Vec<u8> {
            self.state.lock().unwrap().gain_writes.iter().map(|(_, g)| *g).collect()
        }
    }

    impl SignalEngine for TestEngine {
        fn enable(&mut self, mode: u8, adaptive: bool) -> Result<Ack, EngineError> {
            let mut s = self.state.lock().unwrap();
            if s.reject_enable {
                return Err(EngineError::Rejected { op: "enable" });
            }
            s.enabled = true;
            s.mode = mode;
            Ok(if adaptive { Ack::Pending } else { Ack::Done })
        }

        fn disable(&mut self) -> Result<Ack, EngineError> {
            self.state.lock().unwrap().enabled = false;
            Ok(Ack::Done)
        }

        fn set_mode(&mut self, mode: u8, _adaptive: bool, _fast: bool) -> Result<Ack, EngineError> {
            let mut s = self.state.lock().unwrap();
            if s.reject_set_mode {
                return Err(EngineError::Rejected { op: "set_mode" });
            }
            s.mode = mode;
            Ok(Ack::Done)
        }

        fn apply_coarse_gain(&mut self, _mode: u8) -> Result<(), EngineError> {
            Ok(())
        }

        fn write_fine_gain(&mut self, instances: Instances, gain: u8) -> Result<(), EngineError> {
            self.state.lock().unwrap().gain_writes.push((instances, gain));
            Ok(())
        }

        fn gentle_mute(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn read_ff_gain(&mut self) -> Result<u8, EngineError> {
            Ok(self.state.lock().unwrap().ff_gain)
        }

        fn read_fb_gain(&mut self) -> Result<u8, EngineError> {
            Ok(self.state.lock().unwrap().fb_gain)
        }

        fn set_world_volume(&mut self, _gain_db: i8) -> Result<(), EngineError> {
            Ok(())
        }

        fn set_world_volume_balance(
            &mut self,
            _balance: &WorldVolumeBalance,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        fn set_adaptivity(&mut self, _enabled: bool) -> Result<(), EngineError> {
            Ok(())
        }

        fn set_quiet_mode(&mut self, _engaged: bool) -> Result<(), EngineError> {
            Ok(())
        }

        fn set_wind_detection(&mut self, _enabled: bool) -> Result<(), EngineError> {
            Ok(())
        }

        fn set_howling_detection(&mut self, _enabled: bool) -> Result<(), EngineError> {
            Ok(())
        }

        fn set_adverse_handler(&mut self, _enabled: bool) -> Result<(), EngineError> {
            Ok(())
        }

        fn enter_tuning(&mut self, _adaptive: bool) -> Result<(), EngineError> {
            Ok(())
        }

        fn exit_tuning(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn static_mode(fine: u8) -> ModeProfile {
        ModeProfile {
            family: ProcessingFamily::Static,
            function: AcousticFunction::Cancellation,
            noise_id: false,
            fine_gain: [fine, fine],
            world_volume_db: 0,
        }
    }

    fn test_profile() -> AncProfile {
        let mut profile = AncProfile::default();
        // Five static modes so concurrency examples have room.
        profile.modes = vec![
            static_mode(128),
            static_mode(80),
            static_mode(100),
            static_mode(90),
            static_mode(60),
        ];
        profile.ambient_mode = Some(2);
        profile.boot.initial_mode = 0;
        profile
    }

    fn machine(
        profile: AncProfile,
    ) -> (StateMachine<TestEngine>, TestEngine, broadcast::Receiver<Notification>) {
        let engine = TestEngine::default();
        let (notify_tx, notify_rx) = broadcast::channel(256);
        let (self_tx, _self_rx) = mpsc::channel(32);
        let mut m = StateMachine::new(
            profile,
            engine.clone(),
            Box::new(NullSessionStore),
            PeerLink::new(Role::Primary),
            notify_tx,
            self_tx,
        );
        m.initialise().unwrap();
        (m, engine, notify_rx)
    }

    fn powered(profile: AncProfile) -> (StateMachine<TestEngine>, TestEngine, broadcast::Receiver<Notification>) {
        let (mut m, engine, rx) = machine(profile);
        m.step(Event::PowerOn);
        (m, engine, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_initialise_reaches_power_off() {
        let (m, _, _) = machine(test_profile());
        assert_eq!(m.state(), AncState::PowerOff);
    }

    #[tokio::test]
    async fn test_power_on_lands_in_disabled() {
        let (m, _, _) = powered(test_profile());
        assert_eq!(m.state(), AncState::Disabled);
        assert!(!m.session().actual_enabled);
    }

    #[tokio::test]
    async fn test_static_enable_and_settle() {
        let (mut m, engine, _) = powered(test_profile());

        m.step(Event::Enable);
        assert_eq!(m.state(), AncState::Enabled);

        m.step(Event::SettlingTimerFired);
        assert_eq!(m.session().fine_gain, [128, 128]);

        // Ramp went through intermediate values and landed exactly on target.
        let gains = engine.gains();
        assert!(gains.len() > 1);
        assert_eq!(gains.last().copied(), Some(128));
        for pair in gains.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[tokio::test]
    async fn test_adaptive_enable_waits_for_completion() {
        let mut profile = test_profile();
        profile.modes[0].family = ProcessingFamily::Adaptive;
        let (mut m, _, mut rx) = powered(profile);

        m.step(Event::Enable);
        assert_eq!(m.state(), AncState::Disabled);
        assert!(m.session().requested_enabled);
        assert!(!m.session().actual_enabled);

        m.step(Event::EnableComplete);
        assert_eq!(m.state(), AncState::Enabled);

        let enables = drain(&mut rx)
            .into_iter()
            .filter(|n| matches!(n, Notification::EnabledChanged { enabled: true }))
            .count();
        assert_eq!(enables, 1);
    }

    #[tokio::test]
    async fn test_enable_while_pending_is_collapsed() {
        let mut profile = test_profile();
        profile.modes[0].family = ProcessingFamily::Adaptive;
        let (mut m, _, mut rx) = powered(profile);

        m.step(Event::Enable);
        m.step(Event::Enable); // deferred, then a no-op after completion
        m.step(Event::EnableComplete);

        assert_eq!(m.state(), AncState::Enabled);
        let enables = drain(&mut rx)
            .into_iter()
            .filter(|n| matches!(n, Notification::EnabledChanged { enabled: true }))
            .count();
        assert_eq!(enables, 1);
    }

    #[tokio::test]
    async fn test_enable_rejection_rolls_back() {
        let (mut m, engine, _) = powered(test_profile());
        engine.state.lock().unwrap().reject_enable = true;

        m.step(Event::Enable);
        assert_eq!(m.state(), AncState::Disabled);
        assert!(!m.session().requested_enabled);
    }

    #[tokio::test]
    async fn test_set_mode_out_of_range_is_ignored() {
        let (mut m, _, _) = powered(test_profile());
        m.step(Event::Enable);
        m.step(Event::SetMode { mode: 9 });
        assert_eq!(m.session().current_mode, 0);
        assert_eq!(m.session().requested_mode, 0);
    }

    #[tokio::test]
    async fn test_mode_set_rejection_rolls_back_requested_mode() {
        let (mut m, engine, _) = powered(test_profile());
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);

        engine.state.lock().unwrap().reject_set_mode = true;
        m.step(Event::SetMode { mode: 2 });

        assert_eq!(m.session().requested_mode, 0);
        assert_eq!(m.session().current_mode, 0);
        // Lock released so the next request is accepted.
        engine.state.lock().unwrap().reject_set_mode = false;
        m.step(Event::SetMode { mode: 2 });
        assert_eq!(m.session().current_mode, 2);
    }

    #[tokio::test]
    async fn test_toggle_cycle_walks_and_wraps() {
        let mut profile = test_profile();
        profile.modes.truncate(3);
        profile.ambient_mode = None;
        profile.toggle_cycle = [AncConfig::Mode(1), AncConfig::Off, AncConfig::Mode(3)];
        let (mut m, _, _) = powered(profile);

        m.step(Event::ToggleWay);
        assert_eq!(m.state(), AncState::Enabled);
        assert_eq!(m.session().current_mode, 0);

        m.step(Event::ToggleWay);
        assert_eq!(m.state(), AncState::Disabled);

        m.step(Event::ToggleWay);
        assert_eq!(m.state(), AncState::Enabled);
        assert_eq!(m.session().current_mode, 2);

        m.step(Event::ToggleWay);
        assert_eq!(m.state(), AncState::Enabled);
        assert_eq!(m.session().current_mode, 0);
    }

    #[tokio::test]
    async fn test_toggle_unconfigured_is_ignored() {
        let mut profile = test_profile();
        profile.toggle_cycle = [AncConfig::Unset; 3];
        let (mut m, _, _) = powered(profile);

        m.step(Event::ToggleWay);
        assert_eq!(m.state(), AncState::Disabled);
    }

    #[tokio::test]
    async fn test_concurrency_round_trip_restores_prior_state() {
        let mut profile = test_profile();
        profile.scenario_table.voice_call = AncConfig::from_mode_index(4);
        let (mut m, engine, _) = powered(profile);

        // Enabled in mode 2, settled at fine gain 100.
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);
        m.step(Event::SetMode { mode: 2 });
        m.step(Event::SettlingTimerFired);
        assert_eq!(m.session().fine_gain, [100, 100]);

        let users = OutputUsers { voice_call: true, ..Default::default() };
        m.step(Event::ScenarioConnected { users });
        assert_eq!(m.session().current_mode, 4);
        // Mode 2 as a 1-based entry.
        assert_eq!(u8::from(m.session().previous_config), 3);

        engine.state.lock().unwrap().gain_writes.clear();
        m.step(Event::ScenarioDisconnected { users: OutputUsers::default() });
        assert_eq!(m.session().current_mode, 2);
        assert!(m.session().actual_enabled);

        // Gain is ramped back, not jumped.
        m.step(Event::SettlingTimerFired);
        let gains = engine.gains();
        assert!(gains.len() > 2);
        assert_eq!(gains.last().copied(), Some(100));
    }

    #[tokio::test]
    async fn test_concurrency_override_off_disables_without_stamping_mode() {
        let mut profile = test_profile();
        profile.scenario_table.playback = AncConfig::Off;
        let (mut m, _, _) = powered(profile);

        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);
        m.step(Event::SetMode { mode: 1 });
        m.step(Event::SettlingTimerFired);

        let users = OutputUsers { media: true, ..Default::default() };
        m.step(Event::ScenarioConnected { users });
        assert_eq!(m.state(), AncState::Disabled);
        // The snapshot taken at connect is what restore will use.
        assert_eq!(u8::from(m.session().previous_config), 2);

        m.step(Event::ScenarioDisconnected { users: OutputUsers::default() });
        assert_eq!(m.state(), AncState::Enabled);
        assert_eq!(m.session().current_mode, 1);
    }

    #[tokio::test]
    async fn test_scenario_connect_ignored_when_not_worn() {
        let mut profile = test_profile();
        profile.scenario_table.voice_call = AncConfig::from_mode_index(4);
        let (mut m, _, _) = powered(profile);
        m.step(Event::Enable);
        m.step(Event::WearStateChanged { state: WearState::InCase });

        let users = OutputUsers { voice_call: true, ..Default::default() };
        m.step(Event::ScenarioConnected { users });
        assert_eq!(m.session().current_mode, 0);
        assert!(!m.session().concurrency_active);
    }

    #[tokio::test]
    async fn test_noise_id_compatible_switch_is_skipped() {
        let mut profile = test_profile();
        profile.modes[0].noise_id = true;
        profile.modes[4].noise_id = true;
        profile.noise_id_mode_for_category = vec![0, 4];
        profile.scenario_table.voice_call = AncConfig::from_mode_index(4);
        let (mut m, _, _) = powered(profile);

        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);

        let users = OutputUsers { voice_call: true, ..Default::default() };
        m.step(Event::ScenarioConnected { users });
        // Both current and target classify noise themselves: no switch.
        assert_eq!(m.session().current_mode, 0);
    }

    #[tokio::test]
    async fn test_noise_category_switch_and_wind_suppression() {
        let mut profile = test_profile();
        profile.modes[0].noise_id = true;
        profile.modes[3].noise_id = true;
        profile.noise_id_mode_for_category = vec![0, 3];
        let (mut m, _, _) = powered(profile);

        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);
        m.step(Event::SetNoiseIdEnabled { enabled: true });

        // Wind active: the category change is silently held back.
        m.step(Event::WindDetected);
        m.step(Event::NoiseCategoryChanged { category: 1 });
        assert_eq!(m.session().current_mode, 0);

        // Release resynchronizes the suppressed category.
        m.step(Event::WindReleased);
        assert_eq!(m.session().current_mode, 3);
    }

    #[tokio::test]
    async fn test_wind_overrides_quiet_mode() {
        let (mut m, _, mut rx) = powered(test_profile());
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);

        m.step(Event::QuietModeDetected);
        assert!(m.session().quiet_mode_engaged);

        m.step(Event::WindDetected);
        assert!(!m.session().quiet_mode_engaged);

        // Quiet environment still detected, so wind release re-engages it.
        m.step(Event::WindReleased);
        assert!(m.session().quiet_mode_engaged);

        let notifications = drain(&mut rx);
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::WindDetectionChanged { detected: true })));
    }

    #[tokio::test]
    async fn test_world_volume_out_of_range_is_rejected() {
        let (mut m, _, _) = powered(test_profile());
        let before = m.session().world_volume_db[0];

        m.step(Event::SetWorldVolumeGain { gain_db: 20 });
        assert_eq!(m.session().world_volume_db[0], before);

        m.step(Event::SetWorldVolumeGain { gain_db: 4 });
        assert_eq!(m.session().world_volume_db[0], 4);
    }

    #[tokio::test]
    async fn test_world_volume_stepping_saturates() {
        let (mut m, _, _) = powered(test_profile());
        for _ in 0..20 {
            m.step(Event::WorldVolumeUp);
        }
        assert_eq!(m.session().world_volume_db[0], m.profile().world_volume.max_db);

        for _ in 0..40 {
            m.step(Event::WorldVolumeDown);
        }
        assert_eq!(m.session().world_volume_db[0], m.profile().world_volume.min_db);
    }

    #[tokio::test]
    async fn test_self_speech_enters_ambient_and_restores() {
        let (mut m, _, _) = powered(test_profile());
        m.step(Event::SetAutoAmbientEnabled { enabled: true });
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);
        m.step(Event::SetMode { mode: 1 });
        m.step(Event::SettlingTimerFired);

        m.step(Event::SelfSpeechTriggered);
        assert_eq!(m.session().current_mode, 2);
        assert!(m.session().self_speech_active);

        m.step(Event::SelfSpeechReleased);
        assert_eq!(m.session().current_mode, 1);
        assert!(!m.session().self_speech_active);
    }

    #[tokio::test]
    async fn test_self_speech_blocked_during_voice_call() {
        let mut profile = test_profile();
        profile.scenario_table.voice_call = AncConfig::from_mode_index(4);
        let (mut m, _, _) = powered(profile);
        m.step(Event::SetAutoAmbientEnabled { enabled: true });
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);

        let users = OutputUsers { voice_call: true, ..Default::default() };
        m.step(Event::ScenarioConnected { users });
        m.step(Event::SelfSpeechTriggered);

        assert!(!m.session().self_speech_active);
        assert_eq!(m.session().current_mode, 4);
    }

    #[tokio::test]
    async fn test_telemetry_reports_and_peer_stow_defaults() {
        let (mut m, engine, mut rx) = powered(test_profile());
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);
        m.step(Event::SetDemoState { active: true });
        drain(&mut rx);

        engine.state.lock().unwrap().ff_gain = 77;
        engine.state.lock().unwrap().fb_gain = 55;
        m.step(Event::TelemetryTimerFired);

        let notifications = drain(&mut rx);
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::FfGainReport { gain: 77 })));
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::FbGainReport { gain: 55 })));

        // A stowed peer is reported immediately with the passive default.
        m.step(Event::PeerWearStateChanged { state: WearState::InCase });
        let notifications = drain(&mut rx);
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::FfGainReport { gain: PASSIVE_ISOLATION_GAIN })));
    }

    #[tokio::test]
    async fn test_adaptivity_pause_restarts_gain_reporting() {
        let (mut m, engine, mut rx) = powered(test_profile());
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);
        m.step(Event::SetDemoState { active: true });
        m.step(Event::PauseAdaptivity);
        drain(&mut rx);

        engine.state.lock().unwrap().ff_gain = 42;
        m.step(Event::TelemetryTimerFired);
        let notifications = drain(&mut rx);
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::FfGainReport { gain: 42 })));

        m.step(Event::ResumeAdaptivity);
        m.step(Event::TelemetryTimerFired);
        let notifications = drain(&mut rx);
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::FfGainReport { gain: 42 })));
    }

    #[tokio::test]
    async fn test_peer_snapshot_defers_tail_until_enable_completes() {
        let mut profile = test_profile();
        profile.modes[1].family = ProcessingFamily::Adaptive;
        let (mut m, _, _) = powered(profile);

        let mut snapshot = PeerSnapshot::capture(m.session());
        snapshot.enabled = true;
        snapshot.mode = 1;
        snapshot.demo_active = true;

        m.step(Event::PeerSnapshotReceived { snapshot });
        // Mode applied, hardware enable pending, tail not yet applied.
        assert_eq!(m.session().requested_mode, 1);
        assert_eq!(m.state(), AncState::Disabled);
        assert!(!m.session().demo_active);

        m.step(Event::EnableComplete);
        assert_eq!(m.state(), AncState::Enabled);
        assert!(m.session().demo_active);
    }

    #[tokio::test]
    async fn test_snapshot_tail_applies_after_pending_disable() {
        let mut profile = test_profile();
        profile.modes[0].family = ProcessingFamily::Adaptive;
        let (mut m, _, _) = powered(profile);
        m.step(Event::Enable);
        m.step(Event::EnableComplete);
        assert_eq!(m.state(), AncState::Enabled);

        let mut snapshot = PeerSnapshot::capture(m.session());
        snapshot.enabled = false;
        snapshot.demo_active = true;

        m.step(Event::PeerSnapshotReceived { snapshot });
        // Disable is waiting on the gentle mute; the tail waits with it.
        assert!(!m.session().demo_active);

        m.step(Event::GentleMuteTimerFired);
        assert_eq!(m.state(), AncState::Disabled);
        assert!(m.session().demo_active);
    }

    #[tokio::test]
    async fn test_snapshot_tail_applies_after_pending_mode_change() {
        let mut profile = test_profile();
        profile.modes[0].family = ProcessingFamily::Adaptive;
        let (mut m, _, _) = powered(profile);
        m.step(Event::Enable);
        m.step(Event::EnableComplete);

        let mut snapshot = PeerSnapshot::capture(m.session());
        snapshot.mode = 1;
        snapshot.demo_active = true;

        m.step(Event::PeerSnapshotReceived { snapshot });
        // Leaving an adaptive mode goes through the gentle mute first.
        assert!(!m.session().demo_active);
        assert_eq!(m.session().current_mode, 0);

        m.step(Event::GentleMuteTimerFired);
        assert_eq!(m.session().current_mode, 1);
        assert!(m.session().demo_active);
    }

    #[tokio::test]
    async fn test_latest_deferred_request_wins() {
        let mut profile = test_profile();
        profile.modes[0].family = ProcessingFamily::Adaptive;
        let (mut m, _, _) = powered(profile);

        m.step(Event::Enable);
        m.step(Event::SetMode { mode: 2 }); // deferred
        m.step(Event::Disable); // replaces the deferred mode change

        m.step(Event::EnableComplete);
        // The deferred disable ran: gentle-mute path for the adaptive mode.
        assert!(!m.session().requested_enabled);
        m.step(Event::GentleMuteTimerFired);
        assert_eq!(m.state(), AncState::Disabled);
        assert_eq!(m.session().requested_mode, 0);
    }

    #[tokio::test]
    async fn test_tuning_disables_and_returns_to_disabled() {
        let (mut m, _, _) = powered(test_profile());
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);

        m.step(Event::EnterTuning);
        assert_eq!(m.state(), AncState::TuningActive);
        assert!(!m.session().actual_enabled);

        m.step(Event::UsbEnumerated);
        m.step(Event::UsbDetached);
        assert_eq!(m.state(), AncState::Disabled);
    }

    #[tokio::test]
    async fn test_adaptive_tuning_powers_hardware() {
        let (mut m, engine, _) = powered(test_profile());
        assert!(!engine.state.lock().unwrap().enabled);

        m.step(Event::EnterAdaptiveTuning);
        assert_eq!(m.state(), AncState::AdaptiveTuningActive);
        assert!(engine.state.lock().unwrap().enabled);

        m.step(Event::UsbEnumerated);
        m.step(Event::ExitAdaptiveTuning);
        assert_eq!(m.state(), AncState::Disabled);
        assert!(!engine.state.lock().unwrap().enabled);
        assert!(!m.session().actual_enabled);
    }

    #[tokio::test]
    async fn test_power_off_persists_session_block() {
        struct RecordingStore {
            saved: Arc<Mutex<Option<SessionData>>>,
        }
        impl SessionStore for RecordingStore {
            fn load(&self) -> Result<Option<SessionData>, crate::storage::StoreError> {
                Ok(None)
            }
            fn save(&self, data: &SessionData) -> Result<(), crate::storage::StoreError> {
                *self.saved.lock().unwrap() = Some(data.clone());
                Ok(())
            }
        }

        let saved = Arc::new(Mutex::new(None));
        let engine = TestEngine::default();
        let (notify_tx, _) = broadcast::channel(64);
        let (self_tx, _) = mpsc::channel(32);
        let mut m = StateMachine::new(
            test_profile(),
            engine,
            Box::new(RecordingStore { saved: saved.clone() }),
            PeerLink::new(Role::Primary),
            notify_tx,
            self_tx,
        );
        m.initialise().unwrap();
        m.step(Event::PowerOn);
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);
        m.step(Event::SetMode { mode: 1 });
        m.step(Event::SettlingTimerFired);

        m.step(Event::PowerOff);
        assert_eq!(m.state(), AncState::PowerOff);

        let data = saved.lock().unwrap().clone().unwrap();
        assert!(data.enabled);
        assert_eq!(data.mode, 1);
    }

    #[tokio::test]
    async fn test_leakthrough_gain_preserved_across_mode_change() {
        let mut profile = test_profile();
        profile.modes[2].function = AcousticFunction::Leakthrough;
        let (mut m, _, _) = powered(profile);
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);
        m.step(Event::SetMode { mode: 2 });
        m.step(Event::SettlingTimerFired);

        m.step(Event::SetLeakthroughGain { gain: 40 });
        assert_eq!(m.session().fine_gain, [40, 40]);

        // Leave the mode and come back: the adjusted gain is the target.
        m.step(Event::SetMode { mode: 0 });
        m.step(Event::SettlingTimerFired);
        m.step(Event::SetMode { mode: 2 });
        m.step(Event::SettlingTimerFired);
        assert_eq!(m.session().fine_gain, [40, 40]);
    }

    #[tokio::test]
    async fn test_leakthrough_gain_ramps_each_instance_from_its_own_level() {
        let mut profile = test_profile();
        profile.dual_instance = true;
        profile.modes[2].function = AcousticFunction::Leakthrough;
        profile.modes[2].fine_gain = [30, 60];
        let (mut m, engine, _) = powered(profile);
        m.step(Event::Enable);
        m.step(Event::SettlingTimerFired);
        m.step(Event::SetMode { mode: 2 });
        m.step(Event::SettlingTimerFired);
        assert_eq!(m.session().fine_gain, [30, 60]);

        let before = engine.state.lock().unwrap().gain_writes.len();
        m.step(Event::SetLeakthroughGain { gain: 50 });

        let writes = engine.state.lock().unwrap().gain_writes[before..].to_vec();
        for (instances, gain) in &writes {
            match instances {
                // Left climbs from 30, right descends from 60; no write may
                // leave either side of its own path to 50.
                Instances::Left => assert!(*gain > 30 && *gain <= 50, "left wrote {}", gain),
                Instances::Right => assert!(*gain < 60 && *gain >= 50, "right wrote {}", gain),
                Instances::Both => panic!("combined write with unequal instance gains"),
            }
        }
        let last_left = writes.iter().filter(|(i, _)| *i == Instances::Left).last();
        let last_right = writes.iter().filter(|(i, _)| *i == Instances::Right).last();
        assert_eq!(last_left.map(|(_, g)| *g), Some(50));
        assert_eq!(last_right.map(|(_, g)| *g), Some(50));
        assert_eq!(m.session().fine_gain, [50, 50]);
    }
}
