//! Launching, watching and tearing down the fleet.
//!
//! - [`Fleet`]: the root stacks of one run and the operations on them
//! - [`FleetOptions`]: polling interval and optional timeout
//! - [`TestRun`]: the full lifecycle from config file to teardown

mod fleet;
mod poller;
mod run;

pub use fleet::{Fleet, FleetStatus, StackFilter, StackLaunch};
pub use poller::{FleetOptions, PollMessage, POLL_CHANNEL_CAPACITY};
pub use run::{load_config, run_test, run_with, RunOptions, RunOutcome, TestRun};
