//! Deployed stacks, their status and their nested children.

mod lifecycle;
mod model;
mod status;

pub use crate::cloud::{Output, Parameter, Tag};
pub use lifecycle::{name_from_id, Stack, StackOrigin, StackSummary};
pub use model::{is_generic_reason, Event, Resource};
pub use status::{LaunchTracker, StackStatus, StatusBucket, OUT_OF_ORDER_REASON};

/// Capabilities acknowledged on every stack creation.
pub const CAPABILITIES: [&str; 3] = ["CAPABILITY_IAM", "CAPABILITY_NAMED_IAM", "CAPABILITY_AUTO_EXPAND"];
