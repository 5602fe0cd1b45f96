//! Per-region bindings of resolved tests.
//!
//! A [`TestDefinition`] is what the orchestrator launches: the loaded
//! template, the raw parameter set and one [`RegionBinding`] per region, each
//! pointing at the staging bucket its template is served from.

use super::naming::{role_arn, stack_name, stack_tags};
use super::project::{ResolvedProject, ResolvedTest};
use crate::cloud::{default_bucket_region, ClientCache, Tag};
use crate::errors::{ConfigError, FleetError};
use crate::stage::{generate_bucket_name, generate_regional_bucket_name, StagingBucket};
use crate::template::{Template, TemplateLoader};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// One region a test launches in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionBinding {
    /// Region name.
    pub region: String,
    /// Account the profile resolves to.
    pub account_id: String,
    /// Partition of the account.
    pub partition: String,
    /// Credential profile.
    pub profile: String,
    /// Service role, if the test configures one.
    pub role_arn: Option<String>,
    /// Bucket the template is served from.
    pub bucket: StagingBucket,
}

impl RegionBinding {
    /// URL the test's template is served from.
    #[must_use]
    pub fn template_url(&self, template: &Template, key_prefix: &str) -> String {
        self.bucket.object_url(&template.object_key(key_prefix))
    }
}

/// A test ready to launch.
#[derive(Debug, Clone)]
pub struct TestDefinition {
    /// Test name.
    pub name: String,
    /// Loaded root template.
    pub template: Arc<Template>,
    /// One binding per region, in configured order.
    pub bindings: Vec<RegionBinding>,
    /// Tags for every root stack of the test.
    pub tags: Vec<Tag>,
    /// Unrendered parameters.
    pub parameters: Map<String, Value>,
    /// Zone ids never handed out by zone directives.
    pub az_excludes: Vec<String>,
    /// Stack name shared by every region.
    pub stack_name: String,
}

impl TestDefinition {
    /// Every distinct bucket the test needs.
    #[must_use]
    pub fn buckets(&self) -> Vec<&StagingBucket> {
        let mut out: Vec<&StagingBucket> = Vec::new();
        for binding in &self.bindings {
            if !out.iter().any(|b| b.name == binding.bucket.name) {
                out.push(&binding.bucket);
            }
        }
        out
    }
}

/// Merges test parameters over template defaults.
///
/// Test values come first, in the order the configuration lists them, so
/// back-references resolve against earlier entries. Keys the template does
/// not declare are dropped. Declared parameters without a value stay `null`
/// and are rejected at render time.
#[must_use]
pub fn merge_parameters(template: &Template, configured: &Map<String, Value>) -> Map<String, Value> {
    let declared = template.parameters();
    let mut merged = Map::new();
    for (key, value) in configured {
        if declared.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        } else {
            tracing::debug!(parameter = %key, template = %template.relative_path(), "Ignoring undeclared parameter");
        }
    }
    for (key, default) in declared {
        merged.entry(key).or_insert(default);
    }
    merged
}

/// Resolves tests into launchable definitions.
///
/// Buckets are shared between bindings with the same sharing key: the
/// account in the default layout, the account and region in the regional
/// layout.
pub struct BindingResolver<'a> {
    project: &'a ResolvedProject,
    loader: &'a TemplateLoader,
    cache: &'a ClientCache,
    run_id: Uuid,
    buckets: HashMap<String, StagingBucket>,
}

impl<'a> BindingResolver<'a> {
    /// Creates a resolver for one run.
    #[must_use]
    pub fn new(project: &'a ResolvedProject, loader: &'a TemplateLoader, cache: &'a ClientCache, run_id: Uuid) -> Self {
        Self {
            project,
            loader,
            cache,
            run_id,
            buckets: HashMap::new(),
        }
    }

    /// Resolves every test, in project order.
    pub async fn resolve_all(&mut self) -> Result<Vec<TestDefinition>, FleetError> {
        let mut definitions = Vec::with_capacity(self.project.tests.len());
        for test in &self.project.tests {
            definitions.push(self.resolve(test).await?);
        }
        Ok(definitions)
    }

    /// Loads a test's template and binds each of its regions.
    pub async fn resolve(&mut self, test: &ResolvedTest) -> Result<TestDefinition, FleetError> {
        let path = self.loader.project_root().join(&test.template);
        if !path.is_file() {
            return Err(ConfigError::TemplateNotFound {
                test: test.name.clone(),
                path,
            }
            .into());
        }
        let template = self.loader.load(&path)?;

        let mut bindings = Vec::with_capacity(test.regions.len());
        for region in &test.regions {
            bindings.push(self.bind(test, region).await?);
        }

        Ok(TestDefinition {
            name: test.name.clone(),
            parameters: merge_parameters(&template, &test.parameters),
            template,
            bindings,
            tags: stack_tags(self.run_id, &self.project.name, &test.name, &test.tags),
            az_excludes: test.az_blacklist.clone(),
            stack_name: stack_name(&self.project.name, test, self.project.shorten_stack_name, self.run_id),
        })
    }

    async fn bind(&mut self, test: &ResolvedTest, region: &str) -> Result<RegionBinding, FleetError> {
        let profile = test.profile_for(region).to_string();
        let identity = self.cache.identity(&profile).await?;
        let bucket = self
            .bucket_for(test, region, &profile, &identity.account_id, &identity.partition)
            .await?;
        tracing::debug!(
            test = %test.name,
            region = %region,
            profile = %profile,
            bucket = %bucket.name,
            "Bound test region"
        );
        Ok(RegionBinding {
            region: region.to_string(),
            role_arn: role_arn(&identity.partition, &identity.account_id, test.role_name.as_deref()),
            account_id: identity.account_id,
            partition: identity.partition,
            profile,
            bucket,
        })
    }

    async fn bucket_for(
        &mut self,
        test: &ResolvedTest,
        region: &str,
        profile: &str,
        account_id: &str,
        partition: &str,
    ) -> Result<StagingBucket, FleetError> {
        let regional = test.s3_regional_buckets;
        let sharing_key = if regional {
            format!("{account_id}{region}")
        } else {
            account_id.to_string()
        };
        if test.s3_bucket.is_none() {
            if let Some(existing) = self.buckets.get(&sharing_key) {
                return Ok(existing.clone());
            }
        }

        let home = if regional {
            region.to_string()
        } else {
            default_bucket_region(partition).to_string()
        };
        let (name, bucket_region, auto_generated) = match &test.s3_bucket {
            Some(name) => {
                let name = if regional { format!("{name}-{region}") } else { name.clone() };
                let location = self.locate_bucket(&name, profile, &home).await?;
                (name, location, false)
            }
            None if regional => (generate_regional_bucket_name(account_id, region), home, true),
            None => (generate_bucket_name(&self.project.name), home, true),
        };

        let bucket = StagingBucket {
            name,
            region: bucket_region,
            account_id: account_id.to_string(),
            partition: partition.to_string(),
            profile: profile.to_string(),
            auto_generated,
            regional,
            object_acl: self.project.object_acl.clone(),
            sigv4: self.project.sigv4,
            run_id: self.run_id,
            org_id: self.project.org_id.clone(),
        };
        if auto_generated {
            self.buckets.insert(sharing_key, bucket.clone());
        }
        Ok(bucket)
    }

    /// Finds the region of a user-supplied bucket.
    async fn locate_bucket(&self, name: &str, profile: &str, home: &str) -> Result<String, FleetError> {
        let store = self.cache.objects(profile, home).await?;
        match store.bucket_region(name).await? {
            Some(location) => Ok(location),
            None => Err(ConfigError::bucket(name, "bucket does not exist").into()),
        }
    }
}

impl std::fmt::Debug for BindingResolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingResolver")
            .field("project", &self.project.name)
            .field("run_id", &self.run_id)
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

/// Creates or validates every distinct bucket across the given tests.
pub async fn ensure_buckets(cache: &ClientCache, tests: &[TestDefinition]) -> Result<Vec<StagingBucket>, FleetError> {
    let mut distinct: Vec<StagingBucket> = Vec::new();
    for bucket in tests.iter().flat_map(TestDefinition::buckets) {
        if !distinct.iter().any(|b| b.name == bucket.name && b.partition == bucket.partition) {
            distinct.push(bucket.clone());
        }
    }
    for bucket in &distinct {
        let store = cache.objects(&bucket.profile, &bucket.region).await?;
        bucket.ensure(store.as_ref()).await?;
    }
    Ok(distinct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::testing::{InMemoryCloud, ProjectBuilder};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    const TEMPLATE: &str = "Parameters:\n  KeyName:\n    Type: String\n  Count:\n    Type: Number\n    Default: 2\nResources:\n  Topic:\n    Type: AWS::SNS::Topic\n";

    fn resolved(raw: &str) -> ResolvedProject {
        ProjectConfig::parse(Path::new(".stackfleet.yml"), raw)
            .unwrap()
            .resolve()
            .unwrap()
    }

    fn setup() -> (crate::testing::Project, InMemoryCloud) {
        let project = ProjectBuilder::new().file("templates/main.yaml", TEMPLATE).build();
        (project, InMemoryCloud::new())
    }

    #[test]
    fn test_merge_parameters_orders_configured_first() {
        let (project, _) = setup();
        let template = TemplateLoader::new(project.path())
            .load(Path::new("templates/main.yaml"))
            .unwrap();
        let mut configured = Map::new();
        configured.insert("Count".to_string(), Value::from(5));
        configured.insert("Unknown".to_string(), Value::from("x"));

        let merged = merge_parameters(&template, &configured);
        let keys: Vec<&String> = merged.keys().collect();
        assert_eq!(keys, vec!["Count", "KeyName"]);
        assert_eq!(merged["Count"], Value::from(5));
        assert!(merged["KeyName"].is_null());
    }

    #[tokio::test]
    async fn test_legacy_buckets_shared_per_account() {
        let (project, cloud) = setup();
        let config = resolved(
            "project:\n  name: proj\n  regions: [us-east-1, us-west-2]\ntests:\n  a:\n    template: templates/main.yaml\n  b:\n    template: templates/main.yaml\n",
        );
        let loader = TemplateLoader::new(project.path());
        let cache = cloud.client_cache();
        let mut resolver = BindingResolver::new(&config, &loader, &cache, Uuid::new_v4());
        let tests = resolver.resolve_all().await.unwrap();

        assert_eq!(tests.len(), 2);
        let names: Vec<&str> = tests
            .iter()
            .flat_map(|t| t.bindings.iter().map(|b| b.bucket.name.as_str()))
            .collect();
        assert!(names.iter().all(|n| *n == names[0]));
        assert!(tests[0].bindings.iter().all(|b| b.bucket.region == "us-east-1"));
        assert!(tests[0].bindings[0].bucket.auto_generated);
    }

    #[tokio::test]
    async fn test_regional_user_bucket_gets_region_suffix() {
        let (project, cloud) = setup();
        cloud.create_test_bucket("mine-us-west-2", "us-west-2");
        let config = resolved(
            "project:\n  name: proj\n  regions: [us-west-2]\n  s3_bucket: mine\n  s3_regional_buckets: true\ntests:\n  a:\n    template: templates/main.yaml\n",
        );
        let loader = TemplateLoader::new(project.path());
        let cache = cloud.client_cache();
        let mut resolver = BindingResolver::new(&config, &loader, &cache, Uuid::new_v4());
        let tests = resolver.resolve_all().await.unwrap();

        let bucket = &tests[0].bindings[0].bucket;
        assert_eq!(bucket.name, "mine-us-west-2");
        assert_eq!(bucket.region, "us-west-2");
        assert!(!bucket.auto_generated);
    }

    #[tokio::test]
    async fn test_missing_user_bucket_rejected() {
        let (project, cloud) = setup();
        let config = resolved(
            "project:\n  name: proj\n  regions: [us-east-1]\n  s3_bucket: absent\ntests:\n  a:\n    template: templates/main.yaml\n",
        );
        let loader = TemplateLoader::new(project.path());
        let cache = cloud.client_cache();
        let mut resolver = BindingResolver::new(&config, &loader, &cache, Uuid::new_v4());
        let err = resolver.resolve_all().await.unwrap_err();
        assert!(matches!(err, FleetError::Config(ConfigError::Bucket { .. })));
    }

    #[tokio::test]
    async fn test_missing_template_is_config_error() {
        let (project, cloud) = setup();
        let config = resolved(
            "project:\n  name: proj\n  regions: [us-east-1]\ntests:\n  a:\n    template: templates/absent.yaml\n",
        );
        let loader = TemplateLoader::new(project.path());
        let cache = cloud.client_cache();
        let mut resolver = BindingResolver::new(&config, &loader, &cache, Uuid::new_v4());
        let err = resolver.resolve_all().await.unwrap_err();
        assert!(matches!(err, FleetError::Config(ConfigError::TemplateNotFound { .. })));
    }

    #[tokio::test]
    async fn test_role_arn_and_tags() {
        let (project, cloud) = setup();
        let config = resolved(
            "project:\n  name: proj\n  regions: [us-east-1]\n  role_name: deployer\ntests:\n  a:\n    template: templates/main.yaml\n    tags:\n      Owner: team\n",
        );
        let loader = TemplateLoader::new(project.path());
        let cache = cloud.client_cache();
        let mut resolver = BindingResolver::new(&config, &loader, &cache, Uuid::new_v4());
        let test = resolver.resolve(&config.tests[0]).await.unwrap();

        let binding = &test.bindings[0];
        assert_eq!(
            binding.role_arn.as_deref(),
            Some(format!("arn:aws:iam::{}:role/deployer", binding.account_id).as_str())
        );
        assert!(test.tags.iter().any(|t| t.key == "Owner" && t.value == "team"));
        assert!(test.stack_name.starts_with("fleet-proj-a-"));
    }

    #[tokio::test]
    async fn test_ensure_creates_each_bucket_once() {
        let (project, cloud) = setup();
        let config = resolved(
            "project:\n  name: proj\n  regions: [us-east-1, eu-west-1]\n  s3_regional_buckets: true\ntests:\n  a:\n    template: templates/main.yaml\n",
        );
        let loader = TemplateLoader::new(project.path());
        let cache = cloud.client_cache();
        let mut resolver = BindingResolver::new(&config, &loader, &cache, Uuid::new_v4());
        let tests = resolver.resolve_all().await.unwrap();

        let buckets = ensure_buckets(&cache, &tests).await.unwrap();
        assert_eq!(buckets.len(), 2);
        for bucket in &buckets {
            assert!(cloud.bucket_location(&bucket.name).is_some());
        }
        let eu = buckets.iter().find(|b| b.region == "eu-west-1").unwrap();
        assert_eq!(cloud.bucket_location(&eu.name), Some(Some("eu-west-1".to_string())));
    }
}
