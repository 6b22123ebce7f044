//! Trigger manager
//!
//! Several acoustic conditions compete to drive mode behaviour: a disturbance
//! attack (wind), a quiet-environment detector, and Noise-ID category
//! changes. Each has a fixed priority; a request is suppressed while any
//! higher-priority condition is active, and suppressed concerns are given a
//! chance to resynchronize when the higher-priority condition clears.

use tracing::debug;

/// Competing trigger sources, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TriggerKind {
    /// Wind or similar acoustic disturbance attack.
    DisturbanceAttack,
    /// Quiet environment detected.
    QuietEnable,
    /// Ambient noise category (Noise-ID) changed.
    NoiseCategory,
}

impl TriggerKind {
    const ALL: [TriggerKind; 3] = [
        TriggerKind::DisturbanceAttack,
        TriggerKind::QuietEnable,
        TriggerKind::NoiseCategory,
    ];

    /// Lower number wins.
    fn priority(self) -> u8 {
        match self {
            TriggerKind::DisturbanceAttack => 1,
            TriggerKind::QuietEnable => 2,
            TriggerKind::NoiseCategory => 3,
        }
    }
}

/// Outcome of a trigger invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    Proceed,
    SuppressedBy(TriggerKind),
}

/// Priority arbitration between trigger sources.
///
/// The manager only tracks which conditions are currently active; the state
/// machine owns the actions and performs them when `arbitrate` allows.
#[derive(Debug, Default)]
pub struct TriggerManager {
    active: [bool; 3],
}

impl TriggerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a condition active. Idempotent.
    pub fn engage(&mut self, kind: TriggerKind) {
        self.active[kind.priority() as usize - 1] = true;
    }

    /// Clear a condition and report which lower-priority concerns are now
    /// free to resynchronize against the current mode.
    pub fn release(&mut self, kind: TriggerKind) -> Vec<TriggerKind> {
        self.active[kind.priority() as usize - 1] = false;

        TriggerKind::ALL
            .into_iter()
            .filter(|k| k.priority() > kind.priority())
            .filter(|k| self.arbitrate(*k) == Arbitration::Proceed)
            .collect()
    }

    pub fn is_active(&self, kind: TriggerKind) -> bool {
        self.active[kind.priority() as usize - 1]
    }

    /// Decide whether an action for `requested` may run now. Every condition
    /// with strictly higher priority is checked; the first active one wins.
    pub fn arbitrate(&self, requested: TriggerKind) -> Arbitration {
        for kind in TriggerKind::ALL {
            if kind.priority() >= requested.priority() {
                break;
            }
            if self.is_active(kind) {
                debug!(?requested, suppressed_by = ?kind, "trigger suppressed");
                return Arbitration::SuppressedBy(kind);
            }
        }
        Arbitration::Proceed
    }
}
