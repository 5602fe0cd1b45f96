//! Cloud API surface consumed by the fleet.
//!
//! Every provider interaction goes through one of four async traits:
//! [`StackApi`] for stack lifecycle calls, [`ObjectStore`] for buckets and
//! objects, [`LookupApi`] for availability zones and stored secrets, and
//! [`IdentityApi`] for the caller's account. Handles are produced per
//! credential profile and region by a [`ClientFactory`] and memoised by the
//! [`ClientCache`].

mod client_cache;
mod partition;

pub use client_cache::{ClientCache, ServiceKind};
pub use partition::{default_bucket_region, dns_suffix, object_url, template_url_prefix};

use crate::errors::CloudError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Token for the next page, `None` on the last page.
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// Creates a final page.
    #[must_use]
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// A key/value tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Creates a new tag.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A stack launch parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name.
    pub key: String,
    /// Rendered value.
    pub value: String,
    /// Value the provider actually resolved, e.g. for SSM-typed parameters.
    pub resolved_value: Option<String>,
}

impl Parameter {
    /// Creates a new parameter.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            resolved_value: None,
        }
    }
}

/// A stack output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Output key.
    pub key: String,
    /// Output value.
    pub value: String,
    /// Description from the template.
    pub description: Option<String>,
    /// Export name, if exported.
    pub export_name: Option<String>,
}

/// Stack creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStackRequest {
    /// Stack name.
    pub stack_name: String,
    /// URL of the uploaded template.
    pub template_url: String,
    /// Rendered parameters.
    pub parameters: Vec<Parameter>,
    /// Stack tags.
    pub tags: Vec<Tag>,
    /// Capabilities acknowledged on creation.
    pub capabilities: Vec<String>,
    /// Leave failed resources in place for inspection.
    pub disable_rollback: bool,
    /// Service role assumed by the provider, if any.
    pub role_arn: Option<String>,
}

/// Snapshot of a stack as returned by describe-stacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDescription {
    /// Fully-qualified stack id.
    pub stack_id: String,
    /// Stack name.
    pub stack_name: String,
    /// Raw status string.
    pub status: String,
    /// Status reason.
    pub status_reason: Option<String>,
    /// Launch parameters.
    pub parameters: Vec<Parameter>,
    /// Outputs.
    pub outputs: Vec<Output>,
    /// Tags.
    pub tags: Vec<Tag>,
    /// Parent stack id for nested stacks.
    pub parent_id: Option<String>,
    /// Root stack id for nested stacks.
    pub root_id: Option<String>,
    /// Creation timestamp.
    pub creation_time: DateTime<Utc>,
}

/// One stack event as returned by describe-stack-events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEventRecord {
    /// Event id.
    pub event_id: String,
    /// Stack the event belongs to.
    pub stack_id: String,
    /// Logical resource id.
    pub logical_id: String,
    /// Physical resource id.
    pub physical_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Raw resource status.
    pub status: String,
    /// Status reason.
    pub status_reason: Option<String>,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Raw JSON resource properties.
    pub resource_properties: Option<String>,
}

/// One physical resource as returned by list-stack-resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    /// Logical resource id.
    pub logical_id: String,
    /// Physical resource id.
    pub physical_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Raw resource status.
    pub status: String,
    /// Status reason.
    pub status_reason: Option<String>,
    /// Last update timestamp.
    pub last_updated: DateTime<Utc>,
}

/// One object as returned by list-objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Object ETag, quoted as the provider returns it.
    pub etag: String,
}

/// Object upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObjectRequest {
    /// Target bucket.
    pub bucket: String,
    /// Target key.
    pub key: String,
    /// Object body.
    pub body: Vec<u8>,
    /// Canned ACL.
    pub acl: String,
    /// Base64 MD5 of the body, checked by the provider.
    pub content_md5: Option<String>,
    /// Multipart part size. Bodies larger than this go up in parts of exactly
    /// this size, so the stored ETag matches a local checksum taken with it.
    pub part_size: usize,
}

/// A key that a batched delete failed to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    /// Object key.
    pub key: String,
    /// Provider message.
    pub message: String,
}

/// An availability zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityZone {
    /// Zone name, e.g. `us-east-1a`.
    pub zone_name: String,
    /// Zone id, e.g. `use1-az1`.
    pub zone_id: String,
    /// Zone state, e.g. `available`.
    pub state: String,
}

/// Identity of the caller for one credential profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity {
    /// Account id.
    pub account_id: String,
    /// Partition, e.g. `aws`.
    pub partition: String,
}

/// Stack lifecycle calls for one region.
#[async_trait]
pub trait StackApi: Send + Sync {
    /// Creates a stack and returns its id.
    async fn create_stack(&self, request: CreateStackRequest) -> Result<String, CloudError>;

    /// Describes one stack by id or name, or every stack when `stack` is `None`.
    async fn describe_stacks(
        &self,
        stack: Option<&str>,
        next_token: Option<String>,
    ) -> Result<Page<StackDescription>, CloudError>;

    /// Lists events for a stack, newest first.
    async fn describe_stack_events(
        &self,
        stack_id: &str,
        next_token: Option<String>,
    ) -> Result<Page<StackEventRecord>, CloudError>;

    /// Lists the physical resources of a stack.
    async fn list_stack_resources(
        &self,
        stack_id: &str,
        next_token: Option<String>,
    ) -> Result<Page<ResourceSummary>, CloudError>;

    /// Requests deletion of a stack.
    async fn delete_stack(&self, stack_id: &str) -> Result<(), CloudError>;
}

/// Object storage calls for one region.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists objects under a prefix.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        next_token: Option<String>,
    ) -> Result<Page<ObjectSummary>, CloudError>;

    /// Uploads one object.
    ///
    /// Bodies larger than `request.part_size` must be uploaded as multipart
    /// with exactly that part size; smaller bodies go up in a single request.
    async fn put_object(&self, request: PutObjectRequest) -> Result<(), CloudError>;

    /// Downloads one object.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CloudError>;

    /// Deletes up to 1000 objects, returning the keys that failed.
    async fn delete_objects(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<DeleteFailure>, CloudError>;

    /// Generates a presigned GET url.
    async fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, CloudError>;

    /// Creates a bucket. `location` is omitted for the partition's default region.
    async fn create_bucket(&self, bucket: &str, location: Option<&str>) -> Result<(), CloudError>;

    /// Returns the bucket's region, or `None` if the bucket does not exist.
    async fn bucket_region(&self, bucket: &str) -> Result<Option<String>, CloudError>;

    /// Replaces the bucket's tags.
    async fn put_bucket_tagging(&self, bucket: &str, tags: &[Tag]) -> Result<(), CloudError>;

    /// Reads the bucket's tags.
    async fn get_bucket_tagging(&self, bucket: &str) -> Result<Vec<Tag>, CloudError>;

    /// Replaces the bucket policy.
    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), CloudError>;

    /// Deletes an empty bucket.
    async fn delete_bucket(&self, bucket: &str) -> Result<(), CloudError>;
}

/// Lookup services used while rendering parameters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LookupApi: Send + Sync {
    /// Lists availability zones in the region.
    async fn describe_availability_zones(&self) -> Result<Vec<AvailabilityZone>, CloudError>;

    /// Reads a parameter store value, decrypted.
    async fn get_parameter(&self, name: &str) -> Result<String, CloudError>;

    /// Reads a secret's string value.
    async fn get_secret_value(&self, secret_id: &str) -> Result<String, CloudError>;
}

/// Caller identity lookup.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Returns the account and partition of the current credentials.
    async fn caller_identity(&self) -> Result<CallerIdentity, CloudError>;
}

/// Produces service handles for a credential profile and region.
///
/// Creation may fail transiently while credentials are being resolved; the
/// [`ClientCache`] retries those failures.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Creates a stack API handle.
    async fn stack_api(&self, profile: &str, region: &str) -> Result<Arc<dyn StackApi>, CloudError>;

    /// Creates an object store handle.
    async fn object_store(
        &self,
        profile: &str,
        region: &str,
    ) -> Result<Arc<dyn ObjectStore>, CloudError>;

    /// Creates a lookup handle.
    async fn lookup_api(&self, profile: &str, region: &str) -> Result<Arc<dyn LookupApi>, CloudError>;

    /// Creates an identity handle.
    async fn identity_api(&self, profile: &str) -> Result<Arc<dyn IdentityApi>, CloudError>;
}
