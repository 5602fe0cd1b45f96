//! Testing utilities for stackfleet.
//!
//! This module provides:
//! - An in-memory cloud implementing every provider trait
//! - Scripted stack status progressions, including nested stacks
//! - Temporary project trees

mod cloud;
mod fixtures;

pub use cloud::{InMemoryCloud, ProfileClient, RegionClient, StackScript};
pub use fixtures::{Project, ProjectBuilder};
