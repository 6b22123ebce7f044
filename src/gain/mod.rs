//! Gain ramp engine
//!
//! ANC path fine gain is never jumped in one write: a gain change is applied
//! as a staircase of register writes, stepping in small increments at low gain
//! where a unit step is most audible and in larger increments higher up.

mod ramp;

pub use ramp::{
    ramp_down_plan, ramp_down_values, ramp_up_plan, ramp_up_values, GainStep, Instances,
    MAX_FINE_GAIN, MIN_FINE_GAIN, PASSIVE_ISOLATION_GAIN,
};
