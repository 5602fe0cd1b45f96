//! Project configuration file.
//!
//! A config has three sections. `general` holds defaults shared by every
//! project, `project` holds project-wide settings and `tests` names each
//! scenario. Settings propagate downwards: scalar settings are inherited when
//! the inner scope leaves them unset, while parameter, tag and auth maps are
//! merged key by key with the outer scope taking precedence.

use super::overrides::ParameterOverrides;
use crate::errors::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PROJECT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9\-/]*$").expect("project name pattern is valid"));
static TEST_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9\-]*$").expect("test name pattern is valid"));

/// Canned object ACLs accepted for `s3_object_acl`.
pub const OBJECT_ACLS: [&str; 7] = [
    "private",
    "public-read",
    "public-read-write",
    "authenticated-read",
    "aws-exec-read",
    "bucket-owner-read",
    "bucket-owner-full-control",
];

/// Settings shared by the `general` and `project` sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Project name, only meaningful in the `project` section.
    pub name: Option<String>,
    /// Regions to launch in.
    pub regions: Option<Vec<String>>,
    /// Parameter values.
    pub parameters: Map<String, Value>,
    /// Extra stack tags.
    pub tags: BTreeMap<String, String>,
    /// Region to credential profile, `default` as fallback.
    pub auth: BTreeMap<String, String>,
    /// Staging bucket, auto-generated when unset.
    pub s3_bucket: Option<String>,
    /// One bucket per account and region.
    pub s3_regional_buckets: Option<bool>,
    /// Canned ACL for staged objects.
    pub s3_object_acl: Option<String>,
    /// Allow signature v2 requests against the staging bucket.
    pub s3_enable_sig_v2: Option<bool>,
    /// Use the short stack name form.
    pub shorten_stack_name: Option<bool>,
    /// Availability zone ids never allocated.
    pub az_blacklist: Option<Vec<String>>,
    /// IAM role assumed by the stack service.
    pub role_name: Option<String>,
    /// Organisation granted read access to the staging bucket.
    pub org_id: Option<String>,
    /// Template path relative to the project root.
    pub template: Option<String>,
    /// Stack name prefix.
    pub stack_name_prefix: Option<String>,
}

/// One entry of the `tests` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Template path relative to the project root.
    pub template: Option<String>,
    /// Parameter values.
    pub parameters: Map<String, Value>,
    /// Regions to launch in.
    pub regions: Option<Vec<String>>,
    /// Extra stack tags.
    pub tags: BTreeMap<String, String>,
    /// Region to credential profile.
    pub auth: BTreeMap<String, String>,
    /// Staging bucket.
    pub s3_bucket: Option<String>,
    /// One bucket per account and region.
    pub s3_regional_buckets: Option<bool>,
    /// Availability zone ids never allocated.
    pub az_blacklist: Option<Vec<String>>,
    /// IAM role assumed by the stack service.
    pub role_name: Option<String>,
    /// Exact stack name.
    pub stack_name: Option<String>,
    /// Stack name prefix.
    pub stack_name_prefix: Option<String>,
    /// Stack name suffix.
    pub stack_name_suffix: Option<String>,
}

/// The raw configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Defaults for every project.
    pub general: ScopeConfig,
    /// Project settings.
    pub project: ScopeConfig,
    /// Tests by name.
    pub tests: BTreeMap<String, TestConfig>,
}

/// A test with every setting propagated and validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTest {
    /// Test name.
    pub name: String,
    /// Template path relative to the project root.
    pub template: PathBuf,
    /// Regions to launch in.
    pub regions: Vec<String>,
    /// Parameter values.
    pub parameters: Map<String, Value>,
    /// Extra stack tags.
    pub tags: BTreeMap<String, String>,
    /// Region to credential profile.
    pub auth: BTreeMap<String, String>,
    /// Staging bucket, auto-generated when unset.
    pub s3_bucket: Option<String>,
    /// One bucket per account and region.
    pub s3_regional_buckets: bool,
    /// Availability zone ids never allocated.
    pub az_blacklist: Vec<String>,
    /// IAM role assumed by the stack service.
    pub role_name: Option<String>,
    /// Exact stack name.
    pub stack_name: Option<String>,
    /// Stack name prefix.
    pub stack_name_prefix: Option<String>,
    /// Stack name suffix.
    pub stack_name_suffix: Option<String>,
}

impl ResolvedTest {
    /// Credential profile for a region: the region's entry, then `default`.
    #[must_use]
    pub fn profile_for(&self, region: &str) -> &str {
        self.auth
            .get(region)
            .or_else(|| self.auth.get("default"))
            .map_or("default", String::as_str)
    }
}

/// A validated project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProject {
    /// Project name, also the staging key prefix.
    pub name: String,
    /// Canned ACL for staged objects.
    pub object_acl: String,
    /// Enforce signature v4 on staging buckets.
    pub sigv4: bool,
    /// Use the short stack name form.
    pub shorten_stack_name: bool,
    /// Organisation granted read access to staging buckets.
    pub org_id: Option<String>,
    /// Tests in name order.
    pub tests: Vec<ResolvedTest>,
}

impl ResolvedProject {
    /// Looks up a test by name.
    #[must_use]
    pub fn test(&self, name: &str) -> Option<&ResolvedTest> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// Key prefix under which the project is staged.
    #[must_use]
    pub fn key_prefix(&self) -> String {
        format!("{}/", self.name)
    }
}

impl ProjectConfig {
    /// Reads a YAML or JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::file_read(path, e))?;
        Self::parse(path, &raw)
    }

    /// Parses config text. `path` is used for error reporting only.
    pub fn parse(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| ConfigError::parse(path, e))
    }

    /// Applies parameter overrides at project level.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &ParameterOverrides) -> Self {
        for (key, value) in overrides.iter() {
            self.project.parameters.insert(key.clone(), value.clone());
        }
        self
    }

    /// Propagates settings into every test and validates the result.
    pub fn resolve(&self) -> Result<ResolvedProject, ConfigError> {
        let project = propagate_scope(&self.general, &self.project);

        let name = project
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ConfigError::missing_field("name", "project"))?;
        if !PROJECT_NAME.is_match(&name) {
            return Err(ConfigError::invalid_value(
                "project.name",
                &name,
                "only lowercase alphanumerics, '-' and '/' are allowed",
            ));
        }

        let object_acl = project.s3_object_acl.clone().unwrap_or_else(|| "private".to_string());
        if !OBJECT_ACLS.contains(&object_acl.as_str()) {
            return Err(ConfigError::invalid_value(
                "s3_object_acl",
                &object_acl,
                format!("must be one of {}", OBJECT_ACLS.join(", ")),
            ));
        }

        let tests = self
            .tests
            .iter()
            .map(|(test_name, test)| resolve_test(&project, test_name, test))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResolvedProject {
            name,
            object_acl,
            sigv4: !project.s3_enable_sig_v2.unwrap_or(false),
            shorten_stack_name: project.shorten_stack_name.unwrap_or(false),
            org_id: project.org_id.clone(),
            tests,
        })
    }
}

fn merge_outer<V: Clone>(outer: &BTreeMap<String, V>, inner: &BTreeMap<String, V>) -> BTreeMap<String, V> {
    let mut merged = inner.clone();
    merged.extend(outer.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn merge_outer_params(outer: &Map<String, Value>, inner: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = inner.clone();
    for (key, value) in outer {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn propagate_scope(general: &ScopeConfig, project: &ScopeConfig) -> ScopeConfig {
    ScopeConfig {
        name: project.name.clone(),
        regions: project.regions.clone().or_else(|| general.regions.clone()),
        parameters: merge_outer_params(&general.parameters, &project.parameters),
        tags: merge_outer(&general.tags, &project.tags),
        auth: merge_outer(&general.auth, &project.auth),
        s3_bucket: project.s3_bucket.clone().or_else(|| general.s3_bucket.clone()),
        s3_regional_buckets: project.s3_regional_buckets.or(general.s3_regional_buckets),
        s3_object_acl: project.s3_object_acl.clone().or_else(|| general.s3_object_acl.clone()),
        s3_enable_sig_v2: project.s3_enable_sig_v2.or(general.s3_enable_sig_v2),
        shorten_stack_name: project.shorten_stack_name.or(general.shorten_stack_name),
        az_blacklist: project.az_blacklist.clone().or_else(|| general.az_blacklist.clone()),
        role_name: project.role_name.clone().or_else(|| general.role_name.clone()),
        org_id: project.org_id.clone().or_else(|| general.org_id.clone()),
        template: project.template.clone().or_else(|| general.template.clone()),
        stack_name_prefix: project
            .stack_name_prefix
            .clone()
            .or_else(|| general.stack_name_prefix.clone()),
    }
}

fn resolve_test(project: &ScopeConfig, name: &str, test: &TestConfig) -> Result<ResolvedTest, ConfigError> {
    let scope = format!("test '{name}'");
    if !TEST_NAME.is_match(name) {
        return Err(ConfigError::invalid_value(
            "tests",
            name,
            "test names may only contain lowercase alphanumerics and '-'",
        ));
    }

    let template = test
        .template
        .clone()
        .or_else(|| project.template.clone())
        .ok_or_else(|| ConfigError::missing_field("template", &scope))?;
    let regions = test
        .regions
        .clone()
        .or_else(|| project.regions.clone())
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ConfigError::missing_field("regions", &scope))?;

    let stack_name_prefix = test.stack_name_prefix.clone().or_else(|| project.stack_name_prefix.clone());
    let naming = [
        test.stack_name.is_some(),
        stack_name_prefix.is_some(),
        test.stack_name_suffix.is_some(),
    ];
    if naming.iter().filter(|set| **set).count() > 1 {
        return Err(ConfigError::Conflict(format!(
            "{scope}: provide only one of stack_name, stack_name_prefix or stack_name_suffix"
        )));
    }

    Ok(ResolvedTest {
        name: name.to_string(),
        template: PathBuf::from(template),
        regions,
        parameters: merge_outer_params(&project.parameters, &test.parameters),
        tags: merge_outer(&project.tags, &test.tags),
        auth: merge_outer(&project.auth, &test.auth),
        s3_bucket: test.s3_bucket.clone().or_else(|| project.s3_bucket.clone()),
        s3_regional_buckets: test
            .s3_regional_buckets
            .or(project.s3_regional_buckets)
            .unwrap_or(false),
        az_blacklist: test
            .az_blacklist
            .clone()
            .or_else(|| project.az_blacklist.clone())
            .unwrap_or_default(),
        role_name: test.role_name.clone().or_else(|| project.role_name.clone()),
        stack_name: test.stack_name.clone(),
        stack_name_prefix,
        stack_name_suffix: test.stack_name_suffix.clone(),
    })
}
