//! A deployed stack and its nested children.

use super::model::{Event, Resource};
use super::status::{LaunchTracker, StackStatus, StatusBucket};
use crate::cloud::{CreateStackRequest, Output, Parameter, StackApi, StackDescription, Tag};
use crate::errors::{CloudError, FailedStack};
use crate::template::{Template, TemplateLoader};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Where a stack came from: its test, region binding and run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOrigin {
    /// Test the stack belongs to.
    pub test_name: String,
    /// Region the stack lives in.
    pub region: String,
    /// Credential profile used for the region.
    pub profile: String,
    /// Run that created the stack.
    pub run_id: Uuid,
}

impl StackOrigin {
    /// Creates a new origin.
    #[must_use]
    pub fn new(
        test_name: impl Into<String>,
        region: impl Into<String>,
        profile: impl Into<String>,
        run_id: Uuid,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            region: region.into(),
            profile: profile.into(),
            run_id,
        }
    }
}

/// Serializable snapshot of a stack for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSummary {
    /// Fully-qualified stack id.
    pub stack_id: String,
    /// Stack name.
    pub name: String,
    /// Test the stack belongs to.
    pub test_name: String,
    /// Region.
    pub region: String,
    /// Reported status.
    pub status: StackStatus,
    /// Reporting bucket of the status.
    pub bucket: StatusBucket,
    /// Status reason, empty if none.
    pub status_reason: String,
    /// Ids of nested stacks discovered so far.
    pub children: Vec<String>,
}

/// A deployed stack.
///
/// Cloud-side state is only changed through [`Stack::refresh`] and
/// [`Stack::apply`]; events, resources and children are fetched lazily.
pub struct Stack {
    id: String,
    name: String,
    origin: StackOrigin,
    api: Arc<dyn StackApi>,
    template: Option<Arc<Template>>,
    template_url: String,
    status: StackStatus,
    status_reason: String,
    launch: LaunchTracker,
    parameters: Vec<Parameter>,
    outputs: Vec<Output>,
    tags: Vec<Tag>,
    parent_id: Option<String>,
    root_id: Option<String>,
    creation_time: Option<DateTime<Utc>>,
    events: Option<Vec<Event>>,
    resources: Option<Vec<Resource>>,
    children: Vec<Stack>,
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("id", &self.id)
            .field("test_name", &self.origin.test_name)
            .field("region", &self.origin.region)
            .field("status", &self.status)
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

impl Stack {
    /// Creates a handle for an existing stack id.
    #[must_use]
    pub fn new(id: impl Into<String>, origin: StackOrigin, api: Arc<dyn StackApi>) -> Self {
        let id = id.into();
        Self {
            name: name_from_id(&id).to_string(),
            id,
            origin,
            api,
            template: None,
            template_url: String::new(),
            status: StackStatus::default(),
            status_reason: String::new(),
            launch: LaunchTracker::new(),
            parameters: Vec::new(),
            outputs: Vec::new(),
            tags: Vec::new(),
            parent_id: None,
            root_id: None,
            creation_time: None,
            events: None,
            resources: None,
            children: Vec::new(),
        }
    }

    /// Attaches the local template and the URL it was launched from.
    #[must_use]
    pub fn with_template(mut self, template: Option<Arc<Template>>, url: impl Into<String>) -> Self {
        self.template = template;
        self.template_url = url.into();
        self
    }

    /// Launches a stack and reads back its initial state.
    pub async fn create(
        api: Arc<dyn StackApi>,
        origin: StackOrigin,
        request: CreateStackRequest,
        template: Arc<Template>,
    ) -> Result<Self, CloudError> {
        let url = request.template_url.clone();
        let name = request.stack_name.clone();
        let id = api.create_stack(request).await?;
        tracing::info!(
            stack_id = %id,
            stack_name = %name,
            test = %origin.test_name,
            region = %origin.region,
            "Created stack"
        );
        let mut stack = Self::new(id, origin, api).with_template(Some(template), url);
        stack.refresh().await?;
        Ok(stack)
    }

    /// Builds a stack from an existing description.
    #[must_use]
    pub fn import_existing(
        description: StackDescription,
        origin: StackOrigin,
        api: Arc<dyn StackApi>,
        template: Option<Arc<Template>>,
    ) -> Self {
        let mut stack = Self::new(description.stack_id.clone(), origin, api).with_template(template, "");
        stack.apply(description);
        stack
    }

    /// Fully-qualified stack id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stack name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Test, region and run of the stack.
    #[must_use]
    pub fn origin(&self) -> &StackOrigin {
        &self.origin
    }

    /// Test the stack belongs to.
    #[must_use]
    pub fn test_name(&self) -> &str {
        &self.origin.test_name
    }

    /// Region the stack lives in.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.origin.region
    }

    /// Stack API handle for the stack's region.
    #[must_use]
    pub fn api(&self) -> &Arc<dyn StackApi> {
        &self.api
    }

    /// Local template, absent for children launched from outside the project.
    #[must_use]
    pub fn template(&self) -> Option<&Arc<Template>> {
        self.template.as_ref()
    }

    /// URL the stack was launched from.
    #[must_use]
    pub fn template_url(&self) -> &str {
        &self.template_url
    }

    /// Reported status.
    #[must_use]
    pub fn status(&self) -> &StackStatus {
        &self.status
    }

    /// Reporting bucket of the status.
    #[must_use]
    pub fn bucket(&self) -> StatusBucket {
        self.status.bucket()
    }

    /// Status reason, empty if none.
    #[must_use]
    pub fn status_reason(&self) -> &str {
        &self.status_reason
    }

    /// True once CREATE_COMPLETE or UPDATE_COMPLETE has been observed.
    #[must_use]
    pub fn launch_succeeded(&self) -> bool {
        self.launch.launch_succeeded()
    }

    /// Launch parameters.
    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Outputs.
    #[must_use]
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Tags.
    #[must_use]
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Parent stack id of a nested stack.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Root stack id of a nested stack.
    #[must_use]
    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    /// Creation time, once known.
    #[must_use]
    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.creation_time
    }

    /// Nested stacks discovered so far.
    #[must_use]
    pub fn children(&self) -> &[Stack] {
        &self.children
    }

    /// Every nested stack below this one, depth first.
    #[must_use]
    pub fn descendants(&self) -> Vec<&Stack> {
        let mut out = Vec::new();
        let mut pending: Vec<&Stack> = self.children.iter().rev().collect();
        while let Some(stack) = pending.pop() {
            out.push(stack);
            pending.extend(stack.children.iter().rev());
        }
        out
    }

    /// Overrides the status, e.g. when polling gave up on the stack.
    pub fn mark(&mut self, status: StackStatus, reason: impl Into<String>) {
        self.status = status;
        self.status_reason = reason.into();
    }

    /// Re-reads the stack description.
    pub async fn refresh(&mut self) -> Result<(), CloudError> {
        let page = self.api.describe_stacks(Some(&self.id), None).await?;
        let description = page
            .items
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::not_found("describe-stacks", format!("stack {} not found", self.id)))?;
        self.apply(description);
        Ok(())
    }

    /// Applies a freshly fetched description, merging keyed collections.
    pub fn apply(&mut self, description: StackDescription) {
        let previous = self.status.clone();
        let (status, reason) = self.launch.observe(StackStatus::parse(&description.status));
        self.status = status;
        self.status_reason = reason.map_or_else(|| description.status_reason.unwrap_or_default(), str::to_string);

        if previous != self.status {
            tracing::debug!(
                stack_id = %self.id,
                from = %previous,
                to = %self.status,
                "Stack status changed"
            );
        }

        merge_by_key(&mut self.parameters, description.parameters, |p| p.key.clone());
        merge_by_key(&mut self.outputs, description.outputs, |o| o.key.clone());
        merge_by_key(&mut self.tags, description.tags, |t| t.key.clone());
        if !description.stack_name.is_empty() {
            self.name = description.stack_name;
        }
        if description.parent_id.is_some() {
            self.parent_id = description.parent_id;
        }
        if description.root_id.is_some() {
            self.root_id = description.root_id;
        }
        self.creation_time = Some(description.creation_time);
    }

    /// Fetches every event, newest first.
    pub async fn refresh_events(&mut self) -> Result<(), CloudError> {
        let mut events = Vec::new();
        let mut token = None;
        loop {
            let page = self.api.describe_stack_events(&self.id, token).await?;
            events.extend(page.items.into_iter().map(Event::from));
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        self.events = Some(events);
        Ok(())
    }

    /// Events of this stack, fetched on first use or when `refresh` is set.
    pub async fn events(&mut self, refresh: bool, include_generic: bool) -> Result<Vec<Event>, CloudError> {
        if refresh || self.events.is_none() {
            self.refresh_events().await?;
        }
        Ok(self
            .events
            .iter()
            .flatten()
            .filter(|event| include_generic || !event.is_generic())
            .cloned()
            .collect())
    }

    /// Physical resources, fetched on first use or when `refresh` is set.
    pub async fn resources(&mut self, refresh: bool) -> Result<Vec<Resource>, CloudError> {
        if refresh || self.resources.is_none() {
            let mut resources = Vec::new();
            let mut token = None;
            loop {
                let page = self.api.list_stack_resources(&self.id, token).await?;
                resources.extend(
                    page.items
                        .into_iter()
                        .map(|summary| Resource::from_summary(&self.id, &self.origin.test_name, summary)),
                );
                token = page.next_token;
                if token.is_none() {
                    break;
                }
            }
            self.resources = Some(resources);
        }
        Ok(self.resources.clone().unwrap_or_default())
    }

    /// Discovers nested stacks below this one, recursively.
    ///
    /// Children are matched by their parent id. Each child's template is
    /// located through the `TemplateURL` recorded in this stack's events;
    /// children launched from templates outside the project are tracked
    /// without a local template.
    pub fn refresh_children<'a>(&'a mut self, loader: &'a TemplateLoader) -> BoxFuture<'a, Result<(), CloudError>> {
        async move {
            let mut found = Vec::new();
            let mut token = None;
            loop {
                let page = self.api.describe_stacks(None, token).await?;
                found.extend(page.items.into_iter().filter(|d| {
                    d.parent_id.as_deref() == Some(self.id.as_str())
                        && !self.children.iter().any(|c| c.id == d.stack_id)
                }));
                token = page.next_token;
                if token.is_none() {
                    break;
                }
            }

            if !found.is_empty() {
                self.refresh_events().await?;
            }
            for description in found {
                let child = self.import_child(description, loader);
                tracing::debug!(parent = %self.id, child = %child.id, "Discovered nested stack");
                self.children.push(child);
            }
            for child in &mut self.children {
                child.refresh_children(loader).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn import_child(&self, description: StackDescription, loader: &TemplateLoader) -> Self {
        let url = self
            .events
            .iter()
            .flatten()
            .filter(|event| event.physical_id == description.stack_id)
            .find_map(|event| event.template_url().map(str::to_string))
            .unwrap_or_default();

        let template = self.template.as_ref().and_then(|parent| {
            let Some(path) = parent.local_path_for_url(&self.template_url, &url) else {
                tracing::warn!(
                    child = %description.stack_id,
                    url = %url,
                    "Template for nested stack is not part of the project"
                );
                return None;
            };
            match loader.load(&path) {
                Ok(template) => Some(template),
                Err(e) => {
                    tracing::warn!(child = %description.stack_id, error = %e, "Failed to load nested template");
                    None
                }
            }
        });

        let origin = self.origin.clone();
        Self::import_existing(description, origin, Arc::clone(&self.api), template).with_template_url(url)
    }

    fn with_template_url(mut self, url: String) -> Self {
        self.template_url = url;
        self
    }

    /// Failed-class events of this stack and, if `recurse`, of every descendant.
    pub fn error_events<'a>(
        &'a mut self,
        recurse: bool,
        include_generic: bool,
        refresh: bool,
    ) -> BoxFuture<'a, Result<Vec<Event>, CloudError>> {
        async move {
            let mut errors: Vec<Event> = self
                .events(refresh, include_generic)
                .await?
                .into_iter()
                .filter(Event::is_failure)
                .collect();
            if recurse {
                for child in &mut self.children {
                    errors.extend(child.error_events(true, include_generic, refresh).await?);
                }
            }
            Ok(errors)
        }
        .boxed()
    }

    /// Requests deletion. Nested stacks are removed by the provider.
    pub async fn delete(&self) -> Result<(), CloudError> {
        self.api.delete_stack(&self.id).await?;
        tracing::info!(stack_id = %self.id, region = %self.origin.region, "Deleting stack");
        Ok(())
    }

    /// Report snapshot.
    #[must_use]
    pub fn summary(&self) -> StackSummary {
        StackSummary {
            stack_id: self.id.clone(),
            name: self.name.clone(),
            test_name: self.origin.test_name.clone(),
            region: self.origin.region.clone(),
            status: self.status.clone(),
            bucket: self.bucket(),
            status_reason: self.status_reason.clone(),
            children: self.descendants().iter().map(|c| c.id.clone()).collect(),
        }
    }

    /// Failure record for the stack failure summary.
    #[must_use]
    pub fn failure(&self) -> FailedStack {
        FailedStack {
            stack_id: self.id.clone(),
            test_name: self.origin.test_name.clone(),
            region: self.origin.region.clone(),
            status: self.status.to_string(),
            reason: self.status_reason.clone(),
        }
    }
}

/// Extracts the stack name from `arn:<p>:cloudformation:<r>:<a>:stack/<name>/<uuid>`.
#[must_use]
pub fn name_from_id(id: &str) -> &str {
    id.split(':')
        .nth(5)
        .and_then(|resource| resource.split('/').nth(1))
        .unwrap_or(id)
}

fn merge_by_key<T, K: PartialEq>(existing: &mut Vec<T>, incoming: Vec<T>, key: impl Fn(&T) -> K) {
    for item in incoming {
        let k = key(&item);
        match existing.iter_mut().find(|e| key(e) == k) {
            Some(slot) => *slot = item,
            None => existing.push(item),
        }
    }
}
