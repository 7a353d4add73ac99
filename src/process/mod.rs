//! Child process supervision.
//!
//! - [`lifecycle`]: spawn one child with piped stdio and terminate it
//!   gracefully-then-forcefully, exactly once.
//! - [`pool`]: keep a bounded number of warm children ready.

pub mod lifecycle;
pub mod pool;

pub use lifecycle::{ChildProcess, Launcher, Termination, TerminationPolicy};
pub use pool::{PoolSettings, ProcessPool};
