//! End to end lifecycle of one test run.

use super::fleet::{Fleet, FleetStatus, StackFilter, StackLaunch};
use super::poller::FleetOptions;
use crate::cloud::{ClientCache, CreateStackRequest, Parameter};
use crate::config::{
    ensure_buckets, BindingResolver, ParameterOverrides, ProjectConfig, ResolvedProject, TestDefinition,
};
use crate::errors::{ConfigError, FailedStack, FleetError, StackFailureError, TeardownError};
use crate::lint::{default_linters, lint_tree, TemplateLinter};
use crate::observability::{NoOpProgressSink, ProgressEvent, ProgressSink};
use crate::params::{coerce_to_text, ParameterRenderer, RenderContext};
use crate::stack::{StackOrigin, StackSummary, StatusBucket, CAPABILITIES};
use crate::stage::{stage_project, StagingBucket, SyncOptions, CONFIG_FILE_NAME};
use crate::template::TemplateLoader;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What to run and how to clean up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Project configuration file.
    pub config_path: PathBuf,
    /// Directory synchronised to the staging buckets.
    pub project_root: PathBuf,
    /// Optional parameter overrides file.
    pub overrides_path: Option<PathBuf>,
    /// Leave every stack in place.
    pub skip_delete: bool,
    /// Do not lint templates.
    pub skip_lint: bool,
    /// Only delete stacks that succeeded.
    pub keep_failed: bool,
    /// Assume the project is already staged in a configured bucket.
    pub skip_upload: bool,
    /// Poll deleted stacks until they are gone.
    pub wait_for_delete: bool,
    /// Only these tests. `None` runs every test.
    pub test_names: Option<Vec<String>>,
    /// Only these regions. `None` runs every configured region.
    pub regions: Option<Vec<String>>,
}

impl RunOptions {
    /// Options for the project at `project_root` with its default config file.
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            config_path: project_root.join(CONFIG_FILE_NAME),
            project_root,
            overrides_path: None,
            skip_delete: false,
            skip_lint: false,
            keep_failed: false,
            skip_upload: false,
            wait_for_delete: false,
            test_names: None,
            regions: None,
        }
    }

    /// Uses a config file other than the project default.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    /// Applies a parameter overrides file.
    #[must_use]
    pub fn with_overrides_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.overrides_path = Some(path.into());
        self
    }

    /// Skips teardown entirely.
    #[must_use]
    pub fn with_skip_delete(mut self, skip: bool) -> Self {
        self.skip_delete = skip;
        self
    }

    /// Skips template linting.
    #[must_use]
    pub fn with_skip_lint(mut self, skip: bool) -> Self {
        self.skip_lint = skip;
        self
    }

    /// Leaves failed stacks for inspection.
    #[must_use]
    pub fn with_keep_failed(mut self, keep: bool) -> Self {
        self.keep_failed = keep;
        self
    }

    /// Skips synchronising the project.
    #[must_use]
    pub fn with_skip_upload(mut self, skip: bool) -> Self {
        self.skip_upload = skip;
        self
    }

    /// Waits for deletes to finish.
    #[must_use]
    pub fn with_wait_for_delete(mut self, wait: bool) -> Self {
        self.wait_for_delete = wait;
        self
    }

    /// Restricts the run to some tests.
    #[must_use]
    pub fn with_test_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.test_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts the run to some regions.
    #[must_use]
    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = Some(regions.into_iter().map(Into::into).collect());
        self
    }
}

/// Result of a run that got as far as launching stacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Run id, also the stack and bucket tag value.
    pub run_id: Uuid,
    /// Fleet status once every stack settled.
    pub status: FleetStatus,
    /// Snapshot of every root stack, taken before teardown.
    pub summaries: Vec<StackSummary>,
    /// Root stacks in the FAILED bucket.
    pub failures: Vec<FailedStack>,
    /// Deletes that were rejected.
    pub teardown_errors: Vec<String>,
}

impl RunOutcome {
    /// Process exit code: 0 when no stack failed, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(self.status.has_failures())
    }

    /// Returns true if every stack succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.status.has_failures()
    }
}

/// Drives one run: configure, stage, launch, wait, report, tear down.
pub struct TestRun {
    cache: ClientCache,
    options: RunOptions,
    fleet_options: FleetOptions,
    sync_options: SyncOptions,
    linters: Vec<Arc<dyn TemplateLinter>>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for TestRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRun")
            .field("options", &self.options)
            .field("fleet_options", &self.fleet_options)
            .field("linters", &self.linters.iter().map(|l| l.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl TestRun {
    /// Creates a run over `cache` with default linters and no progress output.
    #[must_use]
    pub fn new(cache: ClientCache, options: RunOptions) -> Self {
        Self {
            cache,
            options,
            fleet_options: FleetOptions::default(),
            sync_options: SyncOptions::default(),
            linters: default_linters(),
            sink: Arc::new(NoOpProgressSink),
        }
    }

    /// Sets the polling options.
    #[must_use]
    pub fn with_fleet_options(mut self, options: FleetOptions) -> Self {
        self.fleet_options = options;
        self
    }

    /// Sets the upload options. The ACL is taken from the project config.
    #[must_use]
    pub fn with_sync_options(mut self, options: SyncOptions) -> Self {
        self.sync_options = options;
        self
    }

    /// Replaces the linters.
    #[must_use]
    pub fn with_linters(mut self, linters: Vec<Arc<dyn TemplateLinter>>) -> Self {
        self.linters = linters;
        self
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Runs to completion.
    ///
    /// Errors before any stack exists abort the run. Once stacks exist the
    /// run always reaches teardown; failed stacks show up in the outcome
    /// rather than as an error.
    pub async fn execute(&self) -> Result<RunOutcome, FleetError> {
        let run_id = Uuid::new_v4();
        let project = self.load_project()?;
        info!(run_id = %run_id, project = %project.name, tests = project.tests.len(), "Starting run");

        let loader = TemplateLoader::new(&self.options.project_root);
        let tests = BindingResolver::new(&project, &loader, &self.cache, run_id)
            .resolve_all()
            .await?;

        if self.options.skip_lint {
            info!("Skipping lint");
        } else {
            for test in &tests {
                lint_tree(&self.linters, &test.template).into_result(&test.template)?;
            }
        }

        let buckets = ensure_buckets(&self.cache, &tests).await?;
        self.stage(&project, &buckets).await?;
        let launches = self.render(&project, &tests, run_id).await?;

        let mut fleet = Fleet::new(run_id, project.name.clone())
            .with_options(self.fleet_options.clone())
            .with_sink(Arc::clone(&self.sink));
        if let Err(e) = fleet.create_stacks(&self.cache, launches).await {
            if !self.options.skip_delete {
                for teardown in fleet.delete_stacks(&StackFilter::all()).await {
                    error!(error = %teardown, "Cleanup after failed launch was rejected");
                }
            }
            return Err(e);
        }

        let status = match fleet.wait(&loader).await {
            Ok(status) => status,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Polling failed, tearing down launched stacks");
                for teardown in self.teardown(&mut fleet).await {
                    error!(error = %teardown, "Teardown after failed polling was rejected");
                }
                return Err(e);
            }
        };
        let summaries = fleet.summaries();
        let failures = fleet.failures();
        self.report_failures(&mut fleet).await;

        let mut teardown_errors = self.teardown(&mut fleet).await;
        let all_deleted = !self.options.skip_delete
            && teardown_errors.is_empty()
            && (!self.options.keep_failed || !status.has_failures());
        if all_deleted {
            teardown_errors.extend(self.delete_buckets(&buckets).await);
        }

        self.sink
            .emit(ProgressEvent::RunFinished {
                complete: status.complete.len(),
                failed: status.failed.len(),
            })
            .await;
        info!(
            run_id = %run_id,
            complete = status.complete.len(),
            failed = status.failed.len(),
            "Run finished"
        );

        Ok(RunOutcome {
            run_id,
            status,
            summaries,
            failures,
            teardown_errors: teardown_errors.iter().map(ToString::to_string).collect(),
        })
    }

    fn load_project(&self) -> Result<ResolvedProject, FleetError> {
        let mut config = ProjectConfig::load(&self.options.config_path)?;
        if let Some(path) = &self.options.overrides_path {
            config = config.with_overrides(&ParameterOverrides::load(path)?);
        }
        let mut project = config.resolve()?;

        if let Some(names) = &self.options.test_names {
            if let Some(unknown) = names.iter().find(|n| project.test(n).is_none()) {
                return Err(ConfigError::invalid_value("tests", unknown.as_str(), "no such test in the project").into());
            }
            project.tests.retain(|t| names.contains(&t.name));
        }
        if let Some(regions) = &self.options.regions {
            for test in &mut project.tests {
                test.regions.retain(|r| regions.contains(r));
            }
            project.tests.retain(|t| !t.regions.is_empty());
        }
        if project.tests.is_empty() {
            return Err(ConfigError::Conflict("the selected tests and regions leave nothing to run".to_string()).into());
        }
        if self.options.skip_upload {
            if let Some(test) = project.tests.iter().find(|t| t.s3_bucket.is_none()) {
                return Err(ConfigError::Conflict(format!(
                    "skipping upload needs a configured bucket, test '{}' has none",
                    test.name
                ))
                .into());
            }
        }
        Ok(project)
    }

    async fn stage(&self, project: &ResolvedProject, buckets: &[StagingBucket]) -> Result<(), FleetError> {
        if self.options.skip_upload {
            info!(buckets = buckets.len(), "Skipping upload");
            return Ok(());
        }

        let reports = stage_project(
            &self.cache,
            buckets,
            &self.options.project_root,
            &project.key_prefix(),
            &self.sync_options,
        )
        .await?;
        for (bucket, report) in reports {
            self.sink
                .emit(ProgressEvent::ProjectStaged {
                    bucket,
                    uploaded: report.uploaded,
                    deleted: report.deleted,
                })
                .await;
        }
        Ok(())
    }

    /// Renders every test and region before anything is launched.
    async fn render(
        &self,
        project: &ResolvedProject,
        tests: &[TestDefinition],
        run_id: Uuid,
    ) -> Result<Vec<StackLaunch>, FleetError> {
        let key_prefix = project.key_prefix();
        let mut launches = Vec::new();
        for test in tests {
            for binding in &test.bindings {
                let context = RenderContext::new(binding.region.clone())
                    .with_bucket(binding.bucket.name.clone(), key_prefix.clone())
                    .with_names(project.name.clone(), test.name.clone())
                    .with_az_excludes(test.az_excludes.iter().cloned());
                let renderer = ParameterRenderer::new(
                    context,
                    self.cache.lookup(&binding.profile, &binding.region).await?,
                    self.cache.objects(&binding.profile, &binding.bucket.region).await?,
                );
                let rendered = renderer.render(&test.parameters).await?;

                launches.push(StackLaunch {
                    origin: StackOrigin::new(test.name.clone(), binding.region.clone(), binding.profile.clone(), run_id),
                    request: CreateStackRequest {
                        stack_name: test.stack_name.clone(),
                        template_url: binding.template_url(&test.template, &key_prefix),
                        parameters: rendered
                            .iter()
                            .map(|(key, value)| Parameter::new(key.clone(), coerce_to_text(value)))
                            .collect(),
                        tags: test.tags.clone(),
                        capabilities: CAPABILITIES.iter().map(ToString::to_string).collect(),
                        disable_rollback: true,
                        role_arn: binding.role_arn.clone(),
                    },
                    template: Arc::clone(&test.template),
                });
            }
        }
        Ok(launches)
    }

    async fn report_failures(&self, fleet: &mut Fleet) {
        let failed = StackFilter::all().with_buckets([StatusBucket::Failed]);
        match fleet.error_events(&failed, false, true).await {
            Ok(events) => {
                for event in events {
                    error!(
                        stack_id = %event.stack_id,
                        resource = %event.logical_id,
                        resource_type = %event.resource_type,
                        status = %event.status,
                        reason = %event.status_reason,
                        "Resource failed"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Could not fetch failure events"),
        }
    }

    async fn teardown(&self, fleet: &mut Fleet) -> Vec<TeardownError> {
        if self.options.skip_delete {
            info!("Skipping teardown, stacks are left in place");
            return Vec::new();
        }
        let filter = if self.options.keep_failed {
            StackFilter::all().with_buckets([StatusBucket::Complete])
        } else {
            StackFilter::all()
        };
        let errors = fleet.delete_stacks(&filter).await;
        if self.options.wait_for_delete {
            match fleet.wait_for_delete().await {
                Ok(status) if status.has_failures() => {
                    warn!(failed = status.failed.len(), "Some stacks did not delete cleanly");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Waiting for deletion failed"),
            }
        }
        errors
    }

    async fn delete_buckets(&self, buckets: &[StagingBucket]) -> Vec<TeardownError> {
        let mut errors = Vec::new();
        for bucket in buckets.iter().filter(|b| b.auto_generated) {
            let result = match self.cache.objects(&bucket.profile, &bucket.region).await {
                Ok(store) => bucket.delete(store.as_ref(), true).await,
                Err(e) => Err(TeardownError::new(&bucket.name, e)),
            };
            if let Err(e) = result {
                warn!(error = %e, "Staging bucket cleanup failed");
                errors.push(e);
            }
        }
        errors
    }
}

/// Runs a test project and fails if any stack failed.
///
/// Teardown has already happened when the failure is returned.
pub async fn run_test(cache: ClientCache, options: RunOptions) -> Result<RunOutcome, FleetError> {
    run_with(TestRun::new(cache, options)).await
}

/// Like [`run_test`] for a configured [`TestRun`].
pub async fn run_with(run: TestRun) -> Result<RunOutcome, FleetError> {
    let outcome = run.execute().await?;
    if !outcome.failures.is_empty() {
        return Err(StackFailureError::new(outcome.failures).into());
    }
    Ok(outcome)
}

/// Reads just the project config, e.g. to list tests.
pub fn load_config(path: &Path) -> Result<ResolvedProject, FleetError> {
    Ok(ProjectConfig::load(path)?.resolve()?)
}
