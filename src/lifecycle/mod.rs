//! Daemon lifecycle plumbing

mod shutdown;

pub use shutdown::ShutdownSignal;
