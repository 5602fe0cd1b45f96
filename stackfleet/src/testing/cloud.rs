//! An in-memory cloud for exercising the fleet without a network.

use crate::cloud::{
    AvailabilityZone, CallerIdentity, ClientCache, ClientFactory, CreateStackRequest, DeleteFailure, IdentityApi,
    LookupApi, ObjectStore, ObjectSummary, Page, Parameter, PutObjectRequest, ResourceSummary, StackApi,
    StackDescription, StackEventRecord, Tag,
};
use crate::errors::CloudError;
use crate::stage::{etag_of_bytes, PART_SIZE};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_ACCOUNT: &str = "123456789012";
const DEFAULT_PARTITION: &str = "aws";
const LIST_PAGE_SIZE: usize = 1000;
const NESTED_STACK_TYPE: &str = "AWS::CloudFormation::Stack";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Succeed,
    Fail { status: String, reason: String },
}

/// Scripted behaviour of one stack.
///
/// A stack reports `CREATE_IN_PROGRESS` for the first `n` describe calls by
/// id and its terminal status from then on. Listing every stack does not
/// advance the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackScript {
    settle_after: usize,
    outcome: Outcome,
    children: Vec<(String, String, StackScript)>,
    resources: Vec<(String, String)>,
    delete_failure: Option<String>,
    poll_panic: bool,
}

impl Default for StackScript {
    fn default() -> Self {
        Self::succeeds_after(0)
    }
}

impl StackScript {
    /// Reaches `CREATE_COMPLETE` after `n` in-progress describes.
    #[must_use]
    pub fn succeeds_after(n: usize) -> Self {
        Self {
            settle_after: n,
            outcome: Outcome::Succeed,
            children: Vec::new(),
            resources: Vec::new(),
            delete_failure: None,
            poll_panic: false,
        }
    }

    /// Reaches `CREATE_FAILED` after `n` in-progress describes.
    #[must_use]
    pub fn fails_after(n: usize, reason: impl Into<String>) -> Self {
        Self::settles_as(n, "CREATE_FAILED", reason)
    }

    /// Reaches `ROLLBACK_COMPLETE` after `n` in-progress describes.
    #[must_use]
    pub fn rolls_back_after(n: usize, reason: impl Into<String>) -> Self {
        Self::settles_as(n, "ROLLBACK_COMPLETE", reason)
    }

    /// Never leaves `CREATE_IN_PROGRESS`.
    #[must_use]
    pub fn never_settles() -> Self {
        Self::succeeds_after(usize::MAX)
    }

    fn settles_as(n: usize, status: &str, reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Fail {
                status: status.to_string(),
                reason: reason.into(),
            },
            ..Self::succeeds_after(n)
        }
    }

    /// Adds a nested stack launched from `template_url`.
    #[must_use]
    pub fn with_child(mut self, logical_id: impl Into<String>, template_url: impl Into<String>, script: Self) -> Self {
        self.children.push((logical_id.into(), template_url.into(), script));
        self
    }

    /// Adds a plain resource to the resource listing.
    #[must_use]
    pub fn with_resource(mut self, logical_id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        self.resources.push((logical_id.into(), resource_type.into()));
        self
    }

    /// Makes delete requests end in `DELETE_FAILED`.
    #[must_use]
    pub fn with_delete_failure(mut self, reason: impl Into<String>) -> Self {
        self.delete_failure = Some(reason.into());
        self
    }

    /// Panics on every describe by id after the one made at creation, until
    /// the stack is deleted.
    #[must_use]
    pub fn with_poll_panic(mut self) -> Self {
        self.poll_panic = true;
        self
    }
}

#[derive(Debug, Clone)]
struct StackRecord {
    id: String,
    name: String,
    region: String,
    script: StackScript,
    describes: usize,
    deleted: Option<(String, String)>,
    parameters: Vec<Parameter>,
    tags: Vec<Tag>,
    parent_id: Option<String>,
    root_id: Option<String>,
    created_at: DateTime<Utc>,
    children: Vec<(String, String, String)>,
}

impl StackRecord {
    fn status(&self) -> (String, Option<String>) {
        if let Some((status, reason)) = &self.deleted {
            let reason = (!reason.is_empty()).then(|| reason.clone());
            return (status.clone(), reason);
        }
        if self.describes < self.script.settle_after {
            return ("CREATE_IN_PROGRESS".to_string(), None);
        }
        match &self.script.outcome {
            Outcome::Succeed => ("CREATE_COMPLETE".to_string(), None),
            Outcome::Fail { status, reason } => (status.clone(), Some(reason.clone())),
        }
    }

    fn describe(&self) -> StackDescription {
        let (status, status_reason) = self.status();
        StackDescription {
            stack_id: self.id.clone(),
            stack_name: self.name.clone(),
            status,
            status_reason,
            parameters: self.parameters.clone(),
            outputs: Vec::new(),
            tags: self.tags.clone(),
            parent_id: self.parent_id.clone(),
            root_id: self.root_id.clone(),
            creation_time: self.created_at,
        }
    }

    fn stack_event(&self, sequence: usize, status: &str, reason: Option<String>) -> StackEventRecord {
        StackEventRecord {
            event_id: format!("{}-{sequence}", self.name),
            stack_id: self.id.clone(),
            logical_id: self.name.clone(),
            physical_id: self.id.clone(),
            resource_type: NESTED_STACK_TYPE.to_string(),
            status: status.to_string(),
            status_reason: reason,
            timestamp: self.created_at + ChronoDuration::seconds(i64::try_from(sequence).unwrap_or(i64::MAX)),
            resource_properties: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BucketRecord {
    location: Option<String>,
    tags: Vec<Tag>,
    policies: Vec<String>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    etag: String,
    content_md5: Option<String>,
}

#[derive(Debug, Default)]
struct CloudState {
    accounts: HashMap<String, CallerIdentity>,
    scripts: HashMap<String, StackScript>,
    stacks: Vec<StackRecord>,
    delete_requests: Vec<String>,
    buckets: BTreeMap<String, BucketRecord>,
    objects: BTreeMap<String, BTreeMap<String, StoredObject>>,
    zones: HashMap<String, Vec<AvailabilityZone>>,
    ssm: HashMap<String, String>,
    secrets: HashMap<String, String>,
    put_count: usize,
    delete_calls: usize,
    client_creations: usize,
    failing_client_creations: usize,
    failing_puts: usize,
    put_failure: Option<CloudError>,
    policy_failure: Option<CloudError>,
    create_failures: HashMap<String, CloudError>,
}

impl CloudState {
    fn identity(&self, profile: &str) -> CallerIdentity {
        self.accounts.get(profile).cloned().unwrap_or_else(|| CallerIdentity {
            account_id: DEFAULT_ACCOUNT.to_string(),
            partition: DEFAULT_PARTITION.to_string(),
        })
    }

    fn find_stack(&self, region: &str, stack: &str) -> Option<usize> {
        self.stacks
            .iter()
            .rposition(|s| s.region == region && (s.id == stack || s.name == stack))
    }

    fn launch(
        &mut self,
        region: &str,
        name: &str,
        script: StackScript,
        request: Option<&CreateStackRequest>,
        lineage: Option<(&str, &str)>,
    ) -> String {
        let id = format!(
            "arn:{DEFAULT_PARTITION}:cloudformation:{region}:{DEFAULT_ACCOUNT}:stack/{name}/{}",
            Uuid::new_v4()
        );
        let children = script.children.clone();
        self.stacks.push(StackRecord {
            id: id.clone(),
            name: name.to_string(),
            region: region.to_string(),
            script,
            describes: 0,
            deleted: None,
            parameters: request.map(|r| r.parameters.clone()).unwrap_or_default(),
            tags: request.map(|r| r.tags.clone()).unwrap_or_default(),
            parent_id: lineage.map(|(parent, _)| parent.to_string()),
            root_id: lineage.map(|(_, root)| root.to_string()),
            created_at: Utc::now(),
            children: Vec::new(),
        });

        let root = lineage.map_or_else(|| id.clone(), |(_, root)| root.to_string());
        let mut launched = Vec::new();
        for (logical_id, url, child_script) in children {
            let suffix = Uuid::new_v4().simple().to_string()[..12].to_uppercase();
            let child_name = format!("{name}-{logical_id}-{suffix}");
            let child_id = self.launch(region, &child_name, child_script, None, Some((&id, &root)));
            launched.push((logical_id, url, child_id));
        }
        if let Some(record) = self.stacks.iter_mut().find(|s| s.id == id) {
            record.children = launched;
        }
        id
    }

    fn events(&self, index: usize) -> Vec<StackEventRecord> {
        let record = &self.stacks[index];
        let mut events = vec![record.stack_event(0, "CREATE_IN_PROGRESS", Some("User Initiated".to_string()))];

        for (sequence, (logical_id, url, child_id)) in record.children.iter().enumerate() {
            let Some(child) = self.stacks.iter().find(|s| &s.id == child_id) else {
                continue;
            };
            let (status, reason) = child.status();
            let reason = reason.map(|r| {
                if status.contains("FAILED") || status.contains("ROLLBACK") {
                    format!("Embedded stack {child_id} was not successfully created: {r}")
                } else {
                    r
                }
            });
            events.push(StackEventRecord {
                event_id: format!("{}-child-{sequence}", record.name),
                stack_id: record.id.clone(),
                logical_id: logical_id.clone(),
                physical_id: child_id.clone(),
                resource_type: NESTED_STACK_TYPE.to_string(),
                status,
                status_reason: reason,
                timestamp: record.created_at + ChronoDuration::seconds(1),
                resource_properties: Some(serde_json::json!({ "TemplateURL": url }).to_string()),
            });
        }

        let (status, reason) = record.status();
        if status != "CREATE_IN_PROGRESS" {
            events.push(record.stack_event(events.len() + 1, &status, reason));
        }
        events.reverse();
        events
    }

    fn delete_tree(&mut self, id: &str, status: &str, reason: &str) {
        let Some(record) = self.stacks.iter_mut().find(|s| s.id == id) else {
            return;
        };
        record.deleted = Some((status.to_string(), reason.to_string()));
        let children: Vec<String> = record.children.iter().map(|(_, _, child)| child.clone()).collect();
        for child in children {
            self.delete_tree(&child, status, reason);
        }
    }

    fn creation_attempt(&mut self) -> Result<(), CloudError> {
        if self.failing_client_creations > 0 {
            self.failing_client_creations -= 1;
            return Err(CloudError::transient("create-client", "credentials are being refreshed"));
        }
        self.client_creations += 1;
        Ok(())
    }
}

/// Shared in-memory provider state.
///
/// Every clone and every client handed out views the same state, so tests
/// can script behaviour and inspect effects through the cloud while the
/// code under test talks to its clients.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCloud {
    state: Arc<Mutex<CloudState>>,
}

impl InMemoryCloud {
    /// Creates an empty cloud with default account `123456789012`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a credential profile to an account.
    #[must_use]
    pub fn with_account(self, profile: &str, account_id: &str, partition: &str) -> Self {
        self.state.lock().accounts.insert(
            profile.to_string(),
            CallerIdentity {
                account_id: account_id.to_string(),
                partition: partition.to_string(),
            },
        );
        self
    }

    /// Replaces the zones of a region with `(name, id)` pairs.
    #[must_use]
    pub fn with_zones(self, region: &str, zones: &[(&str, &str)]) -> Self {
        let zones = zones
            .iter()
            .map(|(name, id)| AvailabilityZone {
                zone_name: (*name).to_string(),
                zone_id: (*id).to_string(),
                state: "available".to_string(),
            })
            .collect();
        self.state.lock().zones.insert(region.to_string(), zones);
        self
    }

    /// Stores a parameter store value.
    #[must_use]
    pub fn with_parameter(self, name: &str, value: &str) -> Self {
        self.state.lock().ssm.insert(name.to_string(), value.to_string());
        self
    }

    /// Stores a secret.
    #[must_use]
    pub fn with_secret(self, secret_id: &str, value: &str) -> Self {
        self.state.lock().secrets.insert(secret_id.to_string(), value.to_string());
        self
    }

    /// A client bound to one region.
    #[must_use]
    pub fn region_client(&self, region: &str) -> Arc<RegionClient> {
        Arc::new(RegionClient {
            state: Arc::clone(&self.state),
            region: region.to_string(),
        })
    }

    /// A client cache backed by this cloud.
    #[must_use]
    pub fn client_cache(&self) -> ClientCache {
        ClientCache::new(Arc::new(self.clone()))
    }

    /// Scripts every stack later created with `name`.
    pub fn script_stack(&self, name: &str, script: StackScript) {
        self.state.lock().scripts.insert(name.to_string(), script);
    }

    /// Makes create-stack for `name` fail.
    pub fn fail_stack_creation(&self, name: &str, error: CloudError) {
        self.state.lock().create_failures.insert(name.to_string(), error);
    }

    /// Names and current statuses of every stack, in creation order.
    #[must_use]
    pub fn stack_statuses(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .stacks
            .iter()
            .map(|s| (s.name.clone(), s.status().0))
            .collect()
    }

    /// Ids passed to delete-stack, in call order.
    #[must_use]
    pub fn delete_requests(&self) -> Vec<String> {
        self.state.lock().delete_requests.clone()
    }

    /// Creates a bucket outside the code under test.
    pub fn create_test_bucket(&self, bucket: &str, region: &str) {
        let mut state = self.state.lock();
        state.buckets.insert(
            bucket.to_string(),
            BucketRecord {
                location: Some(region.to_string()),
                ..BucketRecord::default()
            },
        );
        state.objects.entry(bucket.to_string()).or_default();
    }

    /// The location constraint of a bucket: `None` if it does not exist,
    /// `Some(None)` if it was created without one.
    #[must_use]
    pub fn bucket_location(&self, bucket: &str) -> Option<Option<String>> {
        self.state.lock().buckets.get(bucket).map(|b| b.location.clone())
    }

    /// Tags of a bucket.
    #[must_use]
    pub fn bucket_tags(&self, bucket: &str) -> Vec<Tag> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .map(|b| b.tags.clone())
            .unwrap_or_default()
    }

    /// Policies applied to a bucket, in call order.
    #[must_use]
    pub fn bucket_policies(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .map(|b| b.policies.clone())
            .unwrap_or_default()
    }

    /// Makes every put-bucket-policy call fail.
    pub fn fail_bucket_policies(&self, error: CloudError) {
        self.state.lock().policy_failure = Some(error);
    }

    /// Stores an object outside the code under test.
    pub fn put_test_object(&self, bucket: &str, key: &str, body: &[u8]) {
        self.state.lock().objects.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                body: body.to_vec(),
                etag: etag_of_bytes(body, PART_SIZE),
                content_md5: None,
            },
        );
    }

    /// Keys stored in a bucket, sorted.
    #[must_use]
    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .objects
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Content-MD5 sent with the last upload of a key.
    #[must_use]
    pub fn last_content_md5(&self, bucket: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .objects
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .and_then(|object| object.content_md5.clone())
    }

    /// Successful put-object calls.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.state.lock().put_count
    }

    /// Makes the next `n` put-object calls fail with `error`.
    pub fn fail_puts(&self, n: usize, error: CloudError) {
        let mut state = self.state.lock();
        state.failing_puts = n;
        state.put_failure = Some(error);
    }

    /// delete-objects calls.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.state.lock().delete_calls
    }

    /// Clients handed out by the factory.
    #[must_use]
    pub fn client_creations(&self) -> usize {
        self.state.lock().client_creations
    }

    /// Makes the next `n` client creations fail transiently.
    pub fn fail_client_creations(&self, n: usize) {
        self.state.lock().failing_client_creations = n;
    }
}

#[async_trait]
impl ClientFactory for InMemoryCloud {
    async fn stack_api(&self, _profile: &str, region: &str) -> Result<Arc<dyn StackApi>, CloudError> {
        self.state.lock().creation_attempt()?;
        Ok(self.region_client(region))
    }

    async fn object_store(&self, _profile: &str, region: &str) -> Result<Arc<dyn ObjectStore>, CloudError> {
        self.state.lock().creation_attempt()?;
        Ok(self.region_client(region))
    }

    async fn lookup_api(&self, _profile: &str, region: &str) -> Result<Arc<dyn LookupApi>, CloudError> {
        self.state.lock().creation_attempt()?;
        Ok(self.region_client(region))
    }

    async fn identity_api(&self, profile: &str) -> Result<Arc<dyn IdentityApi>, CloudError> {
        self.state.lock().creation_attempt()?;
        Ok(Arc::new(ProfileClient {
            state: Arc::clone(&self.state),
            profile: profile.to_string(),
        }))
    }
}

/// Region-scoped view of an [`InMemoryCloud`].
#[derive(Debug)]
pub struct RegionClient {
    state: Arc<Mutex<CloudState>>,
    region: String,
}

impl RegionClient {
    /// The region this client talks to.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }
}

fn missing_stack(operation: &str, stack: &str) -> CloudError {
    CloudError::not_found(operation, format!("Stack with id {stack} does not exist"))
}

#[async_trait]
impl StackApi for RegionClient {
    async fn create_stack(&self, request: CreateStackRequest) -> Result<String, CloudError> {
        let mut state = self.state.lock();
        if let Some(error) = state.create_failures.get(&request.stack_name) {
            return Err(error.clone());
        }
        let exists = state
            .find_stack(&self.region, &request.stack_name)
            .is_some_and(|i| state.stacks[i].deleted.is_none());
        if exists {
            return Err(CloudError::invalid_request(
                "create-stack",
                format!("Stack [{}] already exists", request.stack_name),
            ));
        }
        let script = state.scripts.get(&request.stack_name).cloned().unwrap_or_default();
        let name = request.stack_name.clone();
        Ok(state.launch(&self.region, &name, script, Some(&request), None))
    }

    async fn describe_stacks(
        &self,
        stack: Option<&str>,
        _next_token: Option<String>,
    ) -> Result<Page<StackDescription>, CloudError> {
        let mut state = self.state.lock();
        match stack {
            Some(stack) => {
                let index = state
                    .find_stack(&self.region, stack)
                    .ok_or_else(|| missing_stack("describe-stacks", stack))?;
                let record = &mut state.stacks[index];
                assert!(
                    !(record.script.poll_panic && record.describes > 0 && record.deleted.is_none()),
                    "scripted describe panic for {stack}"
                );
                let description = record.describe();
                record.describes += 1;
                Ok(Page::last(vec![description]))
            }
            None => Ok(Page::last(
                state
                    .stacks
                    .iter()
                    .filter(|s| s.region == self.region)
                    .map(StackRecord::describe)
                    .collect(),
            )),
        }
    }

    async fn describe_stack_events(
        &self,
        stack_id: &str,
        _next_token: Option<String>,
    ) -> Result<Page<StackEventRecord>, CloudError> {
        let state = self.state.lock();
        let index = state
            .find_stack(&self.region, stack_id)
            .ok_or_else(|| missing_stack("describe-stack-events", stack_id))?;
        Ok(Page::last(state.events(index)))
    }

    async fn list_stack_resources(
        &self,
        stack_id: &str,
        _next_token: Option<String>,
    ) -> Result<Page<ResourceSummary>, CloudError> {
        let state = self.state.lock();
        let index = state
            .find_stack(&self.region, stack_id)
            .ok_or_else(|| missing_stack("list-stack-resources", stack_id))?;
        let record = &state.stacks[index];
        let (status, _) = record.status();

        let mut resources: Vec<ResourceSummary> = record
            .script
            .resources
            .iter()
            .map(|(logical_id, resource_type)| ResourceSummary {
                logical_id: logical_id.clone(),
                physical_id: format!("{}-{logical_id}", record.name),
                resource_type: resource_type.clone(),
                status: status.clone(),
                status_reason: None,
                last_updated: record.created_at,
            })
            .collect();
        for (logical_id, _, child_id) in &record.children {
            if let Some(child) = state.stacks.iter().find(|s| &s.id == child_id) {
                let (status, status_reason) = child.status();
                resources.push(ResourceSummary {
                    logical_id: logical_id.clone(),
                    physical_id: child_id.clone(),
                    resource_type: NESTED_STACK_TYPE.to_string(),
                    status,
                    status_reason,
                    last_updated: child.created_at,
                });
            }
        }
        Ok(Page::last(resources))
    }

    async fn delete_stack(&self, stack_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        let index = state
            .find_stack(&self.region, stack_id)
            .ok_or_else(|| missing_stack("delete-stack", stack_id))?;
        let id = state.stacks[index].id.clone();
        state.delete_requests.push(id.clone());
        match state.stacks[index].script.delete_failure.clone() {
            Some(reason) => state.delete_tree(&id, "DELETE_FAILED", &reason),
            None => state.delete_tree(&id, "DELETE_COMPLETE", ""),
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for RegionClient {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        next_token: Option<String>,
    ) -> Result<Page<ObjectSummary>, CloudError> {
        let state = self.state.lock();
        let Some(objects) = state.objects.get(bucket) else {
            return Ok(Page::last(Vec::new()));
        };
        let mut items: Vec<ObjectSummary> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| next_token.as_ref().map_or(true, |after| *key > after))
            .take(LIST_PAGE_SIZE + 1)
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                etag: object.etag.clone(),
            })
            .collect();
        if items.len() > LIST_PAGE_SIZE {
            items.truncate(LIST_PAGE_SIZE);
            let next_token = items.last().map(|o| o.key.clone());
            return Ok(Page { items, next_token });
        }
        Ok(Page::last(items))
    }

    async fn put_object(&self, request: PutObjectRequest) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        if state.failing_puts > 0 {
            state.failing_puts -= 1;
            if let Some(error) = state.put_failure.clone() {
                return Err(error);
            }
        }
        state.put_count += 1;
        let etag = etag_of_bytes(&request.body, request.part_size);
        state.objects.entry(request.bucket).or_default().insert(
            request.key,
            StoredObject {
                body: request.body,
                etag,
                content_md5: request.content_md5,
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CloudError> {
        self.state
            .lock()
            .objects
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.body.clone())
            .ok_or_else(|| CloudError::not_found("get-object", format!("NoSuchKey: s3://{bucket}/{key}")))
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>, CloudError> {
        let mut state = self.state.lock();
        state.delete_calls += 1;
        if let Some(objects) = state.objects.get_mut(bucket) {
            for key in keys {
                objects.remove(key);
            }
        }
        Ok(Vec::new())
    }

    async fn presigned_url(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String, CloudError> {
        Ok(format!(
            "https://{bucket}.s3.{}.amazonaws.com/{key}?X-Amz-Signature=test&Expires={}",
            self.region,
            expires_in.as_secs()
        ))
    }

    async fn create_bucket(&self, bucket: &str, location: Option<&str>) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        if state.buckets.contains_key(bucket) {
            return Err(CloudError::invalid_request(
                "create-bucket",
                format!("BucketAlreadyOwnedByYou: {bucket}"),
            ));
        }
        state.buckets.insert(
            bucket.to_string(),
            BucketRecord {
                location: location.map(str::to_string),
                ..BucketRecord::default()
            },
        );
        state.objects.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn bucket_region(&self, bucket: &str) -> Result<Option<String>, CloudError> {
        Ok(self
            .state
            .lock()
            .buckets
            .get(bucket)
            .map(|b| b.location.clone().unwrap_or_else(|| "us-east-1".to_string())))
    }

    async fn put_bucket_tagging(&self, bucket: &str, tags: &[Tag]) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        let record = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| CloudError::not_found("put-bucket-tagging", format!("NoSuchBucket: {bucket}")))?;
        record.tags = tags.to_vec();
        Ok(())
    }

    async fn get_bucket_tagging(&self, bucket: &str) -> Result<Vec<Tag>, CloudError> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .map(|b| b.tags.clone())
            .ok_or_else(|| CloudError::not_found("get-bucket-tagging", format!("NoSuchBucket: {bucket}")))
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        if let Some(error) = state.policy_failure.clone() {
            return Err(error);
        }
        let record = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| CloudError::not_found("put-bucket-policy", format!("NoSuchBucket: {bucket}")))?;
        record.policies.push(policy.to_string());
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        if !state.buckets.contains_key(bucket) {
            return Err(CloudError::not_found("delete-bucket", format!("NoSuchBucket: {bucket}")));
        }
        if state.objects.get(bucket).is_some_and(|objects| !objects.is_empty()) {
            return Err(CloudError::invalid_request("delete-bucket", format!("BucketNotEmpty: {bucket}")));
        }
        state.buckets.remove(bucket);
        state.objects.remove(bucket);
        Ok(())
    }
}

/// Six zones `<region>a` to `<region>f` with ids `<region>-az1` to `<region>-az6`.
fn default_zones(region: &str) -> Vec<AvailabilityZone> {
    ('a'..='f')
        .enumerate()
        .map(|(i, letter)| AvailabilityZone {
            zone_name: format!("{region}{letter}"),
            zone_id: format!("{region}-az{}", i + 1),
            state: "available".to_string(),
        })
        .collect()
}

#[async_trait]
impl LookupApi for RegionClient {
    async fn describe_availability_zones(&self) -> Result<Vec<AvailabilityZone>, CloudError> {
        let state = self.state.lock();
        Ok(state
            .zones
            .get(&self.region)
            .cloned()
            .unwrap_or_else(|| default_zones(&self.region)))
    }

    async fn get_parameter(&self, name: &str) -> Result<String, CloudError> {
        self.state
            .lock()
            .ssm
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found("get-parameter", format!("ParameterNotFound: {name}")))
    }

    async fn get_secret_value(&self, secret_id: &str) -> Result<String, CloudError> {
        self.state
            .lock()
            .secrets
            .get(secret_id)
            .cloned()
            .ok_or_else(|| CloudError::not_found("get-secret-value", format!("ResourceNotFound: {secret_id}")))
    }
}

/// Identity client for one profile.
#[derive(Debug)]
pub struct ProfileClient {
    state: Arc<Mutex<CloudState>>,
    profile: String,
}

#[async_trait]
impl IdentityApi for ProfileClient {
    async fn caller_identity(&self) -> Result<CallerIdentity, CloudError> {
        Ok(self.state.lock().identity(&self.profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_advances_only_on_describe_by_id() {
        let cloud = InMemoryCloud::new();
        cloud.script_stack("s", StackScript::succeeds_after(2));
        let client = cloud.region_client("us-east-1");
        let request = CreateStackRequest {
            stack_name: "s".to_string(),
            template_url: String::new(),
            parameters: Vec::new(),
            tags: Vec::new(),
            capabilities: Vec::new(),
            disable_rollback: true,
            role_arn: None,
        };
        let id = client.create_stack(request).await.unwrap();

        client.describe_stacks(None, None).await.unwrap();
        let status = |page: Page<StackDescription>| page.items[0].status.clone();
        assert_eq!(status(client.describe_stacks(Some(&id), None).await.unwrap()), "CREATE_IN_PROGRESS");
        assert_eq!(status(client.describe_stacks(Some(&id), None).await.unwrap()), "CREATE_IN_PROGRESS");
        assert_eq!(status(client.describe_stacks(Some(&id), None).await.unwrap()), "CREATE_COMPLETE");
    }

    #[tokio::test]
    async fn test_children_share_root_and_cascade_delete() {
        let cloud = InMemoryCloud::new();
        cloud.script_stack(
            "p",
            StackScript::succeeds_after(0).with_child("C", "https://b/c.yaml", StackScript::succeeds_after(0)),
        );
        let client = cloud.region_client("us-east-1");
        let request = CreateStackRequest {
            stack_name: "p".to_string(),
            template_url: String::new(),
            parameters: Vec::new(),
            tags: Vec::new(),
            capabilities: Vec::new(),
            disable_rollback: true,
            role_arn: None,
        };
        let id = client.create_stack(request).await.unwrap();

        let all = client.describe_stacks(None, None).await.unwrap().items;
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].parent_id.as_deref(), Some(id.as_str()));
        assert_eq!(all[1].root_id.as_deref(), Some(id.as_str()));

        client.delete_stack(&id).await.unwrap();
        assert!(cloud.stack_statuses().iter().all(|(_, s)| s == "DELETE_COMPLETE"));
        assert_eq!(cloud.delete_requests(), vec![id]);
    }

    #[tokio::test]
    async fn test_list_objects_paginates() {
        let cloud = InMemoryCloud::new();
        for i in 0..1500 {
            cloud.put_test_object("b", &format!("k{i:04}"), b"");
        }
        let client = cloud.region_client("us-east-1");
        let first = client.list_objects("b", "", None).await.unwrap();
        assert_eq!(first.items.len(), 1000);
        let second = client.list_objects("b", "", first.next_token).await.unwrap();
        assert_eq!(second.items.len(), 500);
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_default_zones() {
        let zones = InMemoryCloud::new()
            .region_client("eu-west-1")
            .describe_availability_zones()
            .await
            .unwrap();
        assert_eq!(zones.len(), 6);
        assert_eq!(zones[0].zone_name, "eu-west-1a");
        assert_eq!(zones[5].zone_id, "eu-west-1-az6");
    }
}
