//! Host-side loopback signal engine
//!
//! Stands in for the DSP on development hosts: records gain writes, models
//! enable state, and immediately posts completion events for the
//! asynchronous (adaptive) commands.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::Event;
use crate::gain::Instances;
use crate::state::WorldVolumeBalance;

use super::{Ack, EngineError, SignalEngine};

pub struct LoopbackEngine {
    events: mpsc::Sender<Event>,
    enabled: bool,
    mode: u8,
    fine_gain: [u8; 2],
    world_volume_db: i8,
}

impl LoopbackEngine {
    pub fn new(events: mpsc::Sender<Event>) -> Self {
        Self {
            events,
            enabled: false,
            mode: 0,
            fine_gain: [0, 0],
            world_volume_db: 0,
        }
    }

    pub fn fine_gain(&self) -> [u8; 2] {
        self.fine_gain
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn world_volume_db(&self) -> i8 {
        self.world_volume_db
    }

    fn post(&self, event: Event) {
        if let Err(e) = self.events.try_send(event) {
            warn!(?e, "loopback completion dropped");
        }
    }
}

impl SignalEngine for LoopbackEngine {
    fn enable(&mut self, mode: u8, adaptive: bool) -> Result<Ack, EngineError> {
        self.enabled = true;
        self.mode = mode;
        debug!(mode, adaptive, "loopback enable");
        if adaptive {
            self.post(Event::EnableComplete);
            Ok(Ack::Pending)
        } else {
            Ok(Ack::Done)
        }
    }

    fn disable(&mut self) -> Result<Ack, EngineError> {
        self.enabled = false;
        debug!("loopback disable");
        Ok(Ack::Done)
    }

    fn set_mode(&mut self, mode: u8, adaptive: bool, fast: bool) -> Result<Ack, EngineError> {
        self.mode = mode;
        debug!(mode, adaptive, fast, "loopback set_mode");
        if adaptive && !fast {
            self.post(Event::ModeChangeComplete);
            Ok(Ack::Pending)
        } else {
            Ok(Ack::Done)
        }
    }

    fn apply_coarse_gain(&mut self, mode: u8) -> Result<(), EngineError> {
        debug!(mode, "loopback coarse gain");
        Ok(())
    }

    fn write_fine_gain(&mut self, instances: Instances, gain: u8) -> Result<(), EngineError> {
        match instances {
            Instances::Both => self.fine_gain = [gain, gain],
            Instances::Left => self.fine_gain[0] = gain,
            Instances::Right => self.fine_gain[1] = gain,
        }
        Ok(())
    }

    fn gentle_mute(&mut self) -> Result<(), EngineError> {
        debug!("loopback gentle mute");
        Ok(())
    }

    fn read_ff_gain(&mut self) -> Result<u8, EngineError> {
        Ok(self.fine_gain[0])
    }

    fn read_fb_gain(&mut self) -> Result<u8, EngineError> {
        Ok(self.fine_gain[1])
    }

    fn set_world_volume(&mut self, gain_db: i8) -> Result<(), EngineError> {
        self.world_volume_db = gain_db;
        Ok(())
    }

    fn set_world_volume_balance(&mut self, _balance: &WorldVolumeBalance) -> Result<(), EngineError> {
        Ok(())
    }

    fn set_adaptivity(&mut self, enabled: bool) -> Result<(), EngineError> {
        debug!(enabled, "loopback adaptivity");
        Ok(())
    }

    fn set_quiet_mode(&mut self, engaged: bool) -> Result<(), EngineError> {
        debug!(engaged, "loopback quiet mode");
        Ok(())
    }

    fn set_wind_detection(&mut self, enabled: bool) -> Result<(), EngineError> {
        debug!(enabled, "loopback wind detection");
        Ok(())
    }

    fn set_howling_detection(&mut self, enabled: bool) -> Result<(), EngineError> {
        debug!(enabled, "loopback howling detection");
        Ok(())
    }

    fn set_adverse_handler(&mut self, enabled: bool) -> Result<(), EngineError> {
        debug!(enabled, "loopback adverse handler");
        Ok(())
    }

    fn enter_tuning(&mut self, adaptive: bool) -> Result<(), EngineError> {
        debug!(adaptive, "loopback enter tuning");
        Ok(())
    }

    fn exit_tuning(&mut self) -> Result<(), EngineError> {
        debug!("loopback exit tuning");
        Ok(())
    }
}
