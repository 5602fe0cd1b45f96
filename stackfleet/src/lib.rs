//! # Stackfleet
//!
//! Launches infrastructure templates as stacks across many regions at once,
//! waits for the whole fleet to settle, reports what failed and tears it all
//! down again.
//!
//! A run goes through these steps:
//!
//! - **Configure**: project, test and override files are merged into one
//!   validated view per test
//! - **Lint**: templates and their nested children are checked before any
//!   cloud call that creates something
//! - **Stage**: the project tree is synchronised into staging buckets by
//!   content checksum
//! - **Render**: `$[taskcat_*]` parameter directives are resolved per region
//! - **Launch and poll**: one stack per test and region, polled until no
//!   stack is in progress
//! - **Teardown**: stacks and auto-generated buckets are removed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stackfleet::prelude::*;
//!
//! let cache = ClientCache::new(factory);
//! let outcome = run_test(cache, RunOptions::new("./my-project")).await?;
//! std::process::exit(outcome.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cloud;
pub mod config;
pub mod errors;
pub mod lint;
pub mod observability;
pub mod orchestrator;
pub mod params;
pub mod retry;
pub mod stack;
pub mod stage;
pub mod template;
pub mod testing;

#[cfg(test)]
mod integration_tests;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cloud::{ClientCache, ClientFactory, LookupApi, ObjectStore, StackApi};
    pub use crate::config::{ParameterOverrides, ProjectConfig, ResolvedProject, ResolvedTest};
    pub use crate::errors::{CloudError, ConfigError, FleetError, RenderError, StackFailureError, StageError};
    pub use crate::lint::{StructuralLinter, TemplateLinter};
    pub use crate::observability::{init_tracing, LogFormat, LoggingProgressSink, ProgressEvent, ProgressSink};
    pub use crate::orchestrator::{
        run_test, Fleet, FleetOptions, FleetStatus, RunOptions, RunOutcome, StackFilter, TestRun,
    };
    pub use crate::params::{ParameterRenderer, RenderContext};
    pub use crate::retry::RetryConfig;
    pub use crate::stack::{Stack, StackStatus, StatusBucket};
    pub use crate::stage::{AssetStager, StagingBucket, SyncOptions};
    pub use crate::template::{Template, TemplateLoader};
}
