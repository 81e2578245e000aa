//! Lifecycle management.
//!
//! Periodic sweeps that delete expired files, tickets, grants and sessions,
//! and keep per-user aggregates in step with what remains.

mod scheduler;
mod sweeper;

pub use scheduler::LifecycleScheduler;
pub use sweeper::{LifecycleSweeper, SweepKind, SweepReport};
