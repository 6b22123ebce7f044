//! Fine-gain ramp plan generation
//!
//! The 0..=255 fine-gain range is partitioned into four bands with step sizes
//! 1, 2, 4 and 8. A ramp walks each band in order, then writes the exact
//! target as the final step so band-boundary rounding never leaves the gain
//! off-target. Plans are pure data; the state machine feeds each step to the
//! signal engine.

/// Lowest fine gain value (mute).
pub const MIN_FINE_GAIN: u8 = 0;

/// Highest fine gain value the hardware accepts.
pub const MAX_FINE_GAIN: u8 = 255;

/// Gain reported for an earbud that is stowed in the case: no active path,
/// only the passive isolation of the seal.
pub const PASSIVE_ISOLATION_GAIN: u8 = 0;

/// Which hardware gain instance(s) a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instances {
    Both,
    Left,
    Right,
}

/// A single gain write in a ramp plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GainStep {
    pub instances: Instances,
    pub gain: u8,
}

struct Band {
    lo: u8,
    hi: u8,
    step: u8,
}

const BANDS: [Band; 4] = [
    Band { lo: 1, hi: 32, step: 1 },
    Band { lo: 33, hi: 64, step: 2 },
    Band { lo: 65, hi: 128, step: 4 },
    Band { lo: 129, hi: 255, step: 8 },
];

/// Intermediate gain values for an upward ramp from `from` to `to`.
///
/// The last value is always exactly `to`; `from` itself is not emitted.
/// `from == to` yields an empty plan (a ramp to the current value is a no-op).
pub fn ramp_up_values(from: u8, to: u8) -> Vec<u8> {
    if to <= from {
        return Vec::new();
    }

    let mut values = Vec::new();
    for band in &BANDS {
        if band.lo > to {
            break;
        }
        if band.hi <= from {
            continue;
        }
        let end = to.min(band.hi);
        // Widened arithmetic so stepping near 255 cannot wrap.
        let mut v = if from >= band.lo {
            from as u16 + band.step as u16
        } else {
            band.lo as u16
        };
        while v <= end as u16 {
            values.push(v as u8);
            v += band.step as u16;
        }
    }

    if values.last().copied() != Some(to) {
        values.push(to);
    }
    values
}

/// Intermediate gain values for a downward ramp from `from` to `to`.
///
/// Mirror of [`ramp_up_values`]: walks the bands widest-first, lands exactly
/// on `to`, and is a no-op when `from == to`.
pub fn ramp_down_values(from: u8, to: u8) -> Vec<u8> {
    if from <= to {
        return Vec::new();
    }

    let mut values = Vec::new();
    for band in BANDS.iter().rev() {
        if band.hi <= to {
            break;
        }
        if band.lo > from {
            continue;
        }
        // Do not re-emit `from` itself when it lies inside this band.
        let mut v = if from <= band.hi {
            from as i16 - band.step as i16
        } else {
            band.hi as i16
        };
        while v >= band.lo as i16 && v > to as i16 {
            values.push(v as u8);
            v -= band.step as i16;
        }
    }

    if values.last().copied() != Some(to) {
        values.push(to);
    }
    values
}

/// Upward ramp plan for a pair of instances starting from a common gain.
///
/// Both instances move together to the lower of the two targets, then the
/// instance with the higher target continues alone.
pub fn ramp_up_plan(from: u8, targets: [u8; 2]) -> Vec<GainStep> {
    let common = targets[0].min(targets[1]);
    let mut plan: Vec<GainStep> = ramp_up_values(from.min(common), common)
        .into_iter()
        .map(|gain| GainStep { instances: Instances::Both, gain })
        .collect();

    if targets[0] != targets[1] {
        let (instances, high) = if targets[0] > targets[1] {
            (Instances::Left, targets[0])
        } else {
            (Instances::Right, targets[1])
        };
        plan.extend(
            ramp_up_values(common, high)
                .into_iter()
                .map(|gain| GainStep { instances, gain }),
        );
    }
    plan
}

/// Downward ramp plan for a pair of instances ending at a common gain.
///
/// The instance sitting higher is brought down to the common value first,
/// then both instances descend together to `to`.
pub fn ramp_down_plan(current: [u8; 2], to: u8) -> Vec<GainStep> {
    let common = current[0].min(current[1]);
    let mut plan = Vec::new();

    if current[0] != current[1] {
        let (instances, high) = if current[0] > current[1] {
            (Instances::Left, current[0])
        } else {
            (Instances::Right, current[1])
        };
        plan.extend(
            ramp_down_values(high, common)
                .into_iter()
                .map(|gain| GainStep { instances, gain }),
        );
    }

    plan.extend(
        ramp_down_values(common, to.min(common))
            .into_iter()
            .map(|gain| GainStep { instances: Instances::Both, gain }),
    );
    plan
}
