//! # tcproxy-reclaim
//!
//! Keeps a task claim alive while the task runs.
//!
//! - [`state_machine`]: pure `Idle -> Active -> {Stopped, Aborted}` transitions
//! - [`Reclaimer`]: the async driver that ticks, calls the coordinator and
//!   installs fresh credentials into the shared store

pub mod reclaimer;
pub mod state_machine;

pub use reclaimer::{ReclaimSchedule, Reclaimer, ReclaimerHandle};
pub use state_machine::{transition, ReclaimAction, ReclaimEvent, ReclaimState};
