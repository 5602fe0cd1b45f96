//! The set of root stacks launched by one run.

use super::poller::{spawn_worker, FleetOptions, PollMessage, POLL_CHANNEL_CAPACITY};
use crate::cloud::{ClientCache, CreateStackRequest, StackApi};
use crate::config::{ResolvedProject, TAG_PROJECT_NAME, TAG_RUN_ID, TAG_TEST_NAME};
use crate::errors::{CloudError, FailedStack, FleetError, TeardownError};
use crate::observability::{NoOpProgressSink, ProgressEvent, ProgressSink};
use crate::stack::{Event, Resource, Stack, StackOrigin, StackStatus, StackSummary, StatusBucket};
use crate::template::{Template, TemplateLoader};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One root stack to launch.
#[derive(Debug, Clone)]
pub struct StackLaunch {
    /// Test, region and profile of the stack.
    pub origin: StackOrigin,
    /// Fully rendered creation request.
    pub request: CreateStackRequest,
    /// Local template the request points at.
    pub template: Arc<Template>,
}

/// Ids of root stacks per reporting bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetStatus {
    /// Stacks in the COMPLETE bucket.
    pub complete: Vec<String>,
    /// Stacks still in progress.
    pub in_progress: Vec<String>,
    /// Stacks in the FAILED bucket.
    pub failed: Vec<String>,
}

impl FleetStatus {
    /// Returns true once no stack is in progress.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.in_progress.is_empty()
    }

    /// Returns true if any stack failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Total number of stacks.
    #[must_use]
    pub fn total(&self) -> usize {
        self.complete.len() + self.in_progress.len() + self.failed.len()
    }

    fn progress_event(&self) -> ProgressEvent {
        ProgressEvent::FleetStatus {
            complete: self.complete.len(),
            in_progress: self.in_progress.len(),
            failed: self.failed.len(),
        }
    }
}

/// Selects root stacks. Unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackFilter {
    /// Only stacks of these tests.
    pub test_names: Option<Vec<String>>,
    /// Only stacks in these regions.
    pub regions: Option<Vec<String>>,
    /// Only stacks whose status is in these buckets.
    pub buckets: Option<Vec<StatusBucket>>,
}

impl StackFilter {
    /// Matches every stack.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to the given tests.
    #[must_use]
    pub fn with_test_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.test_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts to the given regions.
    #[must_use]
    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = Some(regions.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts to the given status buckets.
    #[must_use]
    pub fn with_buckets(mut self, buckets: impl IntoIterator<Item = StatusBucket>) -> Self {
        self.buckets = Some(buckets.into_iter().collect());
        self
    }

    /// Returns true if `stack` passes every set criterion.
    #[must_use]
    pub fn matches(&self, stack: &Stack) -> bool {
        self.test_names
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == stack.test_name()))
            && self
                .regions
                .as_ref()
                .map_or(true, |regions| regions.iter().any(|r| r == stack.region()))
            && self
                .buckets
                .as_ref()
                .map_or(true, |buckets| buckets.contains(&stack.bucket()))
    }
}

/// Every root stack of one run.
///
/// Creation fans out across regions, polling runs one worker per profile
/// and region, and all state changes are applied here as worker messages
/// arrive so the fleet-wide view is always consistent.
pub struct Fleet {
    run_id: Uuid,
    project_name: String,
    stacks: Vec<Stack>,
    options: FleetOptions,
    sink: Arc<dyn ProgressSink>,
}

impl fmt::Debug for Fleet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fleet")
            .field("run_id", &self.run_id)
            .field("project_name", &self.project_name)
            .field("stacks", &self.stacks)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Fleet {
    /// Creates an empty fleet.
    #[must_use]
    pub fn new(run_id: Uuid, project_name: impl Into<String>) -> Self {
        Self {
            run_id,
            project_name: project_name.into(),
            stacks: Vec::new(),
            options: FleetOptions::default(),
            sink: Arc::new(NoOpProgressSink),
        }
    }

    /// Sets the polling options.
    #[must_use]
    pub fn with_options(mut self, options: FleetOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run the fleet belongs to.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Project name.
    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Root stacks in launch order.
    #[must_use]
    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    /// Number of root stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Returns true if nothing was launched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Adds an already launched stack.
    pub fn push(&mut self, stack: Stack) {
        self.stacks.push(stack);
    }

    /// Launches every stack concurrently.
    ///
    /// Stacks that were created are kept even when another launch fails, so
    /// they can still be torn down. The first launch error is returned.
    pub async fn create_stacks(&mut self, cache: &ClientCache, launches: Vec<StackLaunch>) -> Result<(), FleetError> {
        let attempts = launches.into_iter().map(|launch| async move {
            let StackLaunch {
                origin,
                request,
                template,
            } = launch;
            let api = cache.stacks(&origin.profile, &origin.region).await?;
            Stack::create(api, origin, request, template).await
        });

        let mut first_error = None;
        for result in join_all(attempts).await {
            match result {
                Ok(stack) => {
                    self.sink
                        .emit(ProgressEvent::StackCreated {
                            stack_id: stack.id().to_string(),
                            test_name: stack.test_name().to_string(),
                            region: stack.region().to_string(),
                        })
                        .await;
                    self.stacks.push(stack);
                }
                Err(e) => {
                    error!(error = %e, "Stack creation failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Current ids per bucket.
    #[must_use]
    pub fn status(&self) -> FleetStatus {
        let mut status = FleetStatus::default();
        for stack in &self.stacks {
            let id = stack.id().to_string();
            match stack.bucket() {
                StatusBucket::Complete => status.complete.push(id),
                StatusBucket::InProgress => status.in_progress.push(id),
                StatusBucket::Failed => status.failed.push(id),
            }
        }
        status
    }

    /// Polls until every stack settles, then discovers nested stacks.
    ///
    /// Failed stacks do not stop polling of their siblings.
    pub async fn wait(&mut self, loader: &TemplateLoader) -> Result<FleetStatus, FleetError> {
        self.poll().await?;
        for stack in &mut self.stacks {
            if let Err(e) = stack.refresh_children(loader).await {
                warn!(stack_id = %stack.id(), error = %e, "Nested stack discovery failed");
            }
        }
        let status = self.status();
        info!(
            complete = status.complete.len(),
            failed = status.failed.len(),
            "Fleet settled"
        );
        Ok(status)
    }

    async fn poll(&mut self) -> Result<(), FleetError> {
        let mut groups: BTreeMap<(String, String), (Arc<dyn StackApi>, Vec<String>)> = BTreeMap::new();
        for stack in self.stacks.iter().filter(|s| !s.status().is_settled()) {
            let origin = stack.origin();
            groups
                .entry((origin.profile.clone(), origin.region.clone()))
                .or_insert_with(|| (Arc::clone(stack.api()), Vec::new()))
                .1
                .push(stack.id().to_string());
        }
        if groups.is_empty() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(POLL_CHANNEL_CAPACITY);
        let workers: Vec<_> = groups
            .into_values()
            .map(|(api, ids)| spawn_worker(api, ids, self.options.poll_interval, tx.clone()))
            .collect();
        drop(tx);

        let deadline = self.options.stack_timeout.map(|t| tokio::time::Instant::now() + t);
        let mut timed_out = false;
        loop {
            let message = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(message) => message,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                },
                None => rx.recv().await,
            };
            let Some(message) = message else {
                break;
            };
            self.handle(message).await;
        }

        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            match worker.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => return Err(FleetError::Internal(format!("status poller panicked: {e}"))),
            }
        }

        if timed_out {
            let timeout = self.options.stack_timeout.unwrap_or_default();
            for stack in self.stacks.iter_mut().filter(|s| !s.status().is_settled()) {
                warn!(stack_id = %stack.id(), ?timeout, "Stack did not settle in time");
                let reason = format!("timed out after {}s waiting for {}", timeout.as_secs(), stack.status());
                give_up(stack, reason);
            }
            self.sink.emit(self.status().progress_event()).await;
        }
        Ok(())
    }

    async fn handle(&mut self, message: PollMessage) {
        let (stack_id, outcome) = match message {
            PollMessage::Status { stack_id, description } => (stack_id, Ok(description)),
            PollMessage::Failed { stack_id, error } => (stack_id, Err(error)),
        };
        let Some(stack) = self.stacks.iter_mut().find(|s| s.id() == stack_id) else {
            return;
        };

        let previous = stack.status().clone();
        match outcome {
            Ok(description) => stack.apply(description),
            Err(e) => {
                error!(stack_id = %stack_id, error = %e, "Status polling failed");
                give_up(stack, format!("Status polling failed: {e}"));
            }
        }
        if *stack.status() == previous {
            return;
        }

        let event = ProgressEvent::StatusChanged {
            stack_id: stack.id().to_string(),
            test_name: stack.test_name().to_string(),
            region: stack.region().to_string(),
            status: stack.status().clone(),
            bucket: stack.bucket(),
        };
        self.sink.emit(event).await;
        self.sink.emit(self.status().progress_event()).await;
    }

    /// Events of matching root stacks, newest first per stack.
    pub async fn events(
        &mut self,
        filter: &StackFilter,
        include_generic: bool,
        refresh: bool,
    ) -> Result<Vec<Event>, CloudError> {
        let mut out = Vec::new();
        for stack in self.stacks.iter_mut().filter(|s| filter.matches(s)) {
            out.extend(stack.events(refresh, include_generic).await?);
        }
        Ok(out)
    }

    /// Failed-class events of matching stacks and their descendants.
    pub async fn error_events(
        &mut self,
        filter: &StackFilter,
        include_generic: bool,
        refresh: bool,
    ) -> Result<Vec<Event>, CloudError> {
        let mut out = Vec::new();
        for stack in self.stacks.iter_mut().filter(|s| filter.matches(s)) {
            out.extend(stack.error_events(true, include_generic, refresh).await?);
        }
        Ok(out)
    }

    /// Resources of matching root stacks.
    pub async fn resources(&mut self, filter: &StackFilter, refresh: bool) -> Result<Vec<Resource>, CloudError> {
        let mut out = Vec::new();
        for stack in self.stacks.iter_mut().filter(|s| filter.matches(s)) {
            out.extend(stack.resources(refresh).await?);
        }
        Ok(out)
    }

    /// Requests deletion of matching root stacks.
    ///
    /// Deletes are grouped per profile and region; groups run concurrently.
    /// Children are removed by the provider. Rejected deletes are returned,
    /// never raised, so teardown cannot mask the run outcome.
    pub async fn delete_stacks(&mut self, filter: &StackFilter) -> Vec<TeardownError> {
        let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
        for (index, stack) in self.stacks.iter().enumerate().filter(|(_, s)| filter.matches(s)) {
            groups
                .entry((stack.origin().profile.clone(), stack.origin().region.clone()))
                .or_default()
                .push(index);
        }

        let stacks = &self.stacks;
        let deletes = groups.into_values().map(|indices| async move {
            let mut results = Vec::with_capacity(indices.len());
            for index in indices {
                let stack = &stacks[index];
                let result = stack.delete().await.map_err(|e| TeardownError::new(stack.id(), e));
                results.push((index, result));
            }
            results
        });
        let results: Vec<(usize, Result<(), TeardownError>)> = join_all(deletes).await.into_iter().flatten().collect();

        let mut errors = Vec::new();
        for (index, result) in results {
            match result {
                Ok(()) => {
                    let stack = &mut self.stacks[index];
                    let reason = stack.status_reason().to_string();
                    stack.mark(StackStatus::DeleteInProgress, reason);
                    self.sink
                        .emit(ProgressEvent::StackDeleted {
                            stack_id: stack.id().to_string(),
                            region: stack.region().to_string(),
                        })
                        .await;
                }
                Err(e) => {
                    warn!(error = %e, "Stack delete rejected");
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Polls stacks whose delete was requested until they are gone.
    pub async fn wait_for_delete(&mut self) -> Result<FleetStatus, FleetError> {
        self.poll().await?;
        Ok(self.status())
    }

    /// Failure records of root stacks in the FAILED bucket.
    #[must_use]
    pub fn failures(&self) -> Vec<FailedStack> {
        self.stacks
            .iter()
            .filter(|s| s.bucket() == StatusBucket::Failed)
            .map(Stack::failure)
            .collect()
    }

    /// Report snapshot of every root stack.
    #[must_use]
    pub fn summaries(&self) -> Vec<StackSummary> {
        self.stacks.iter().map(Stack::summary).collect()
    }

    /// Re-imports the root stacks a past run left behind.
    ///
    /// Stacks are matched on the run, project and test tags in every
    /// region each test is configured for. Nested stacks are skipped; they
    /// go with their root.
    pub async fn from_existing(
        cache: &ClientCache,
        run_id: Uuid,
        project: &ResolvedProject,
        options: FleetOptions,
    ) -> Result<Self, FleetError> {
        let mut fleet = Self::new(run_id, project.name.clone()).with_options(options);
        let run_tag = run_id.simple().to_string();

        for test in &project.tests {
            for region in &test.regions {
                let profile = test.profile_for(region);
                let api = cache.stacks(profile, region).await?;
                let mut token = None;
                loop {
                    let page = api.describe_stacks(None, token).await?;
                    for description in page.items {
                        let tagged = |key: &str, value: &str| {
                            description.tags.iter().any(|t| t.key == key && t.value == value)
                        };
                        if description.parent_id.is_some()
                            || !tagged(TAG_RUN_ID, &run_tag)
                            || !tagged(TAG_PROJECT_NAME, &project.name)
                            || !tagged(TAG_TEST_NAME, &test.name)
                            || fleet.stacks.iter().any(|s| s.id() == description.stack_id)
                        {
                            continue;
                        }
                        let origin = StackOrigin::new(test.name.clone(), region.clone(), profile, run_id);
                        fleet
                            .stacks
                            .push(Stack::import_existing(description, origin, Arc::clone(&api), None));
                    }
                    token = page.next_token;
                    if token.is_none() {
                        break;
                    }
                }
            }
        }
        info!(run_id = %run_id, stacks = fleet.stacks.len(), "Imported existing stacks");
        Ok(fleet)
    }
}

fn give_up(stack: &mut Stack, reason: String) {
    let status = if *stack.status() == StackStatus::DeleteInProgress {
        StackStatus::DeleteFailed
    } else {
        StackStatus::CreateFailed
    };
    stack.mark(status, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::observability::CollectingProgressSink;
    use crate::testing::{InMemoryCloud, ProjectBuilder, StackScript};
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::time::Duration;

    const TEMPLATE: &str = "Resources:\n  Topic:\n    Type: AWS::SNS::Topic\n";

    fn fast() -> FleetOptions {
        FleetOptions::new().with_poll_interval(Duration::from_millis(1))
    }

    fn launch(project: &crate::testing::Project, test: &str, region: &str, name: &str, run_id: Uuid) -> StackLaunch {
        let template = TemplateLoader::new(project.path())
            .load(Path::new("main.yaml"))
            .unwrap();
        StackLaunch {
            origin: StackOrigin::new(test, region, "default", run_id),
            request: CreateStackRequest {
                stack_name: name.to_string(),
                template_url: "https://b.s3.us-east-1.amazonaws.com/p/main.yaml".to_string(),
                parameters: Vec::new(),
                tags: crate::config::stack_tags(run_id, "p", test, &BTreeMap::new()),
                capabilities: Vec::new(),
                disable_rollback: true,
                role_arn: None,
            },
            template,
        }
    }

    struct Setup {
        project: crate::testing::Project,
        cloud: InMemoryCloud,
        cache: ClientCache,
        sink: Arc<CollectingProgressSink>,
        run_id: Uuid,
    }

    fn setup() -> Setup {
        let cloud = InMemoryCloud::new();
        Setup {
            project: ProjectBuilder::new().file("main.yaml", TEMPLATE).build(),
            cache: cloud.client_cache(),
            cloud,
            sink: Arc::new(CollectingProgressSink::new()),
            run_id: Uuid::new_v4(),
        }
    }

    impl Setup {
        fn fleet(&self, options: FleetOptions) -> Fleet {
            Fleet::new(self.run_id, "p")
                .with_options(options)
                .with_sink(Arc::clone(&self.sink) as Arc<dyn ProgressSink>)
        }

        fn launch(&self, test: &str, region: &str, name: &str) -> StackLaunch {
            launch(&self.project, test, region, name, self.run_id)
        }
    }

    #[tokio::test]
    async fn test_mixed_fleet_aggregates_buckets() {
        let s = setup();
        s.cloud.script_stack("ok", StackScript::succeeds_after(1));
        s.cloud.script_stack("slow", StackScript::succeeds_after(3));
        s.cloud.script_stack("bad", StackScript::fails_after(2, "Topic failed"));

        let mut fleet = s.fleet(fast());
        fleet
            .create_stacks(
                &s.cache,
                vec![
                    s.launch("a", "us-east-1", "ok"),
                    s.launch("a", "us-west-2", "slow"),
                    s.launch("b", "us-east-1", "bad"),
                ],
            )
            .await
            .unwrap();
        let before = fleet.status();
        assert_eq!(
            (before.complete.len(), before.in_progress.len(), before.failed.len()),
            (0, 3, 0)
        );

        let status = fleet.wait(&TemplateLoader::new(s.project.path())).await.unwrap();
        assert!(status.is_settled());
        assert_eq!((status.complete.len(), status.failed.len()), (2, 1));
        assert_eq!(fleet.failures()[0].reason, "Topic failed");
        assert_eq!(s.sink.events_of_type("stack.created").len(), 3);
        assert!(!s.sink.events_of_type("stack.status_changed").is_empty());
    }

    #[tokio::test]
    async fn test_running_stack_blocks_settlement() {
        let s = setup();
        s.cloud.script_stack("done", StackScript::succeeds_after(0));
        s.cloud.script_stack("running", StackScript::succeeds_after(2));
        s.cloud.script_stack("broken", StackScript::fails_after(0, "Topic failed"));

        let mut fleet = s.fleet(fast());
        fleet
            .create_stacks(
                &s.cache,
                vec![
                    s.launch("a", "us-east-1", "done"),
                    s.launch("a", "us-west-2", "running"),
                    s.launch("b", "us-east-1", "broken"),
                ],
            )
            .await
            .unwrap();

        let partial = fleet.status();
        assert_eq!(partial.in_progress.len(), 1);
        assert_eq!((partial.complete.len(), partial.failed.len()), (1, 1));
        assert!(!partial.is_settled());
        assert!(partial.has_failures());
        assert_eq!(partial.total(), 3);

        let settled = fleet.wait(&TemplateLoader::new(s.project.path())).await.unwrap();
        assert!(settled.is_settled());
        assert_eq!((settled.complete.len(), settled.failed.len()), (2, 1));
    }

    #[tokio::test]
    async fn test_creation_error_keeps_created_stacks() {
        let s = setup();
        s.cloud
            .fail_stack_creation("rejected", CloudError::invalid_request("create-stack", "bad template"));
        let mut fleet = s.fleet(fast());
        let err = fleet
            .create_stacks(
                &s.cache,
                vec![s.launch("a", "us-east-1", "fine"), s.launch("a", "eu-west-1", "rejected")],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad template"));
        assert_eq!(fleet.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_marks_running_stacks_failed() {
        let s = setup();
        s.cloud.script_stack("stuck", StackScript::never_settles());
        let mut fleet = s.fleet(fast().with_stack_timeout(Duration::from_millis(50)));
        fleet
            .create_stacks(&s.cache, vec![s.launch("a", "us-east-1", "stuck")])
            .await
            .unwrap();

        let status = fleet.wait(&TemplateLoader::new(s.project.path())).await.unwrap();
        assert_eq!(status.failed.len(), 1);
        let failure = &fleet.failures()[0];
        assert_eq!(failure.status, "CREATE_FAILED");
        assert!(failure.reason.starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_nested_stacks_discovered_after_wait() {
        let s = setup();
        s.cloud.script_stack(
            "parent",
            StackScript::succeeds_after(1).with_child(
                "Child",
                "https://b.s3.us-east-1.amazonaws.com/p/main.yaml",
                StackScript::fails_after(0, "Bucket already exists"),
            ),
        );
        let mut fleet = s.fleet(fast());
        fleet
            .create_stacks(&s.cache, vec![s.launch("a", "us-east-1", "parent")])
            .await
            .unwrap();
        fleet.wait(&TemplateLoader::new(s.project.path())).await.unwrap();

        assert_eq!(fleet.stacks()[0].children().len(), 1);
        let errors = fleet.error_events(&StackFilter::all(), false, true).await.unwrap();
        assert!(errors.iter().any(|e| e.status_reason == "Bucket already exists"));
    }

    #[tokio::test]
    async fn test_keep_failed_deletes_only_complete() {
        let s = setup();
        s.cloud.script_stack("bad", StackScript::fails_after(0, "nope"));
        let mut fleet = s.fleet(fast());
        fleet
            .create_stacks(
                &s.cache,
                vec![s.launch("a", "us-east-1", "good"), s.launch("a", "us-west-2", "bad")],
            )
            .await
            .unwrap();
        fleet.wait(&TemplateLoader::new(s.project.path())).await.unwrap();

        let errors = fleet
            .delete_stacks(&StackFilter::all().with_buckets([StatusBucket::Complete]))
            .await;
        assert!(errors.is_empty());
        let deleted = s.cloud.delete_requests();
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].contains("stack/good/"));

        let status = fleet.wait_for_delete().await.unwrap();
        assert_eq!(status.complete.len(), 1);
        assert_eq!(*fleet.stacks()[0].status(), StackStatus::DeleteComplete);
        assert_eq!(s.sink.events_of_type("stack.deleted").len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_delete_is_reported() {
        let s = setup();
        let mut fleet = s.fleet(fast());
        fleet.push(Stack::new(
            "arn:aws:cloudformation:us-east-1:123456789012:stack/ghost/1",
            StackOrigin::new("a", "us-east-1", "default", s.run_id),
            s.cloud.region_client("us-east-1"),
        ));
        let errors = fleet.delete_stacks(&StackFilter::all()).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].target.contains("ghost"));
    }

    #[tokio::test]
    async fn test_failed_delete_after_wait() {
        let s = setup();
        s.cloud
            .script_stack("sticky", StackScript::succeeds_after(0).with_delete_failure("resource in use"));
        let mut fleet = s.fleet(fast());
        fleet
            .create_stacks(&s.cache, vec![s.launch("a", "us-east-1", "sticky")])
            .await
            .unwrap();
        assert!(fleet.delete_stacks(&StackFilter::all()).await.is_empty());
        let status = fleet.wait_for_delete().await.unwrap();
        assert_eq!(status.failed.len(), 1);
        assert_eq!(*fleet.stacks()[0].status(), StackStatus::DeleteFailed);
    }

    #[tokio::test]
    async fn test_filter_and_resources() {
        let s = setup();
        s.cloud
            .script_stack("one", StackScript::succeeds_after(0).with_resource("Topic", "AWS::SNS::Topic"));
        let mut fleet = s.fleet(fast());
        fleet
            .create_stacks(
                &s.cache,
                vec![s.launch("a", "us-east-1", "one"), s.launch("b", "us-east-1", "two")],
            )
            .await
            .unwrap();

        let resources = fleet
            .resources(&StackFilter::all().with_test_names(["a"]), false)
            .await
            .unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].logical_id, "Topic");

        let events = tokio_test::assert_ok!(
            fleet
                .events(&StackFilter::all().with_regions(["eu-west-1"]), true, false)
                .await
        );
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_from_existing_filters_by_tags() {
        let s = setup();
        let project = ProjectConfig::parse(
            Path::new(".stackfleet.yml"),
            "project:\n  name: p\n  regions: [us-east-1]\ntests:\n  a:\n    template: main.yaml\n",
        )
        .unwrap()
        .resolve()
        .unwrap();

        s.cloud.script_stack(
            "mine",
            StackScript::succeeds_after(0).with_child("Child", "https://b/p/main.yaml", StackScript::default()),
        );
        let mut original = s.fleet(fast());
        original
            .create_stacks(&s.cache, vec![s.launch("a", "us-east-1", "mine")])
            .await
            .unwrap();
        let other_run = Uuid::new_v4();
        let mut unrelated = Fleet::new(other_run, "p");
        unrelated
            .create_stacks(&s.cache, vec![launch(&s.project, "a", "us-east-1", "theirs", other_run)])
            .await
            .unwrap();

        let fleet = Fleet::from_existing(&s.cache, s.run_id, &project, fast()).await.unwrap();
        assert_eq!(fleet.len(), 1);
        assert_eq!(fleet.stacks()[0].name(), "mine");
        assert_eq!(fleet.stacks()[0].test_name(), "a");
    }
}
