//! Project configuration, parameter overrides and per-region bindings.

mod binding;
mod naming;
mod overrides;
mod project;

pub use binding::{ensure_buckets, merge_parameters, BindingResolver, RegionBinding, TestDefinition};
pub use naming::{role_arn, stack_name, stack_tags, STACK_NAME_PREFIX, TAG_PROJECT_NAME, TAG_RUN_ID, TAG_TEST_NAME};
pub use overrides::ParameterOverrides;
pub use project::{ProjectConfig, ResolvedProject, ResolvedTest, ScopeConfig, TestConfig, OBJECT_ACLS};
