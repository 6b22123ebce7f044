//! anc-daemon: control plane for Active Noise Cancellation on a wireless
//! earbud.
//!
//! The crate is organized around one state machine consuming a single event
//! stream:
//! - [`state`]: the session record and the ANC state machine
//! - [`gain`]: fine-gain ramp plan generation
//! - [`arbiter`]: concurrency scenarios and their configuration overrides
//! - [`trigger`]: priority arbitration between acoustic trigger sources
//! - [`peer`]: session mirroring between paired earbuds
//! - [`signal`]: the signal engine (DSP) boundary
//! - [`ipc`]: Unix-socket control protocol
//! - [`config`], [`storage`], [`events`], [`lifecycle`]: profile loading,
//!   session persistence, message types and shutdown plumbing

pub mod arbiter;
pub mod config;
pub mod events;
pub mod gain;
pub mod ipc;
pub mod lifecycle;
pub mod peer;
pub mod signal;
pub mod state;
pub mod storage;
pub mod trigger;
