//! ANC session state and the state machine that drives it

mod machine;
mod session;

pub use machine::{AncState, StateMachine};
pub use session::{
    next_toggle_disabled, next_toggle_enabled, AncConfig, BalanceSide, Session, WearState,
    WorldVolumeBalance,
};
