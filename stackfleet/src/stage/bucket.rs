//! Staging buckets.

use crate::cloud::{object_url, ObjectStore, Tag};
use crate::errors::{CloudError, ConfigError, FleetError, StageError, TeardownError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Prefix of generated bucket names.
pub const BUCKET_NAME_PREFIX: &str = "fleet";

/// Tag carrying the run id on non-regional buckets.
pub const RUN_ID_TAG: &str = "stackfleet-id";

/// Maximum objects per batched delete call.
pub const DELETE_BATCH_SIZE: usize = 1000;

const MAX_BUCKET_NAME_LEN: usize = 63;
const DEFAULT_LOCATION: &str = "us-east-1";

/// Generates `fleet-<project>-<8 random chars>`, at most 63 characters.
#[must_use]
pub fn generate_bucket_name(project: &str) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
        .collect();

    let mid = format!("-{}-", project.replace('/', "-"));
    let available = MAX_BUCKET_NAME_LEN - BUCKET_NAME_PREFIX.len() - suffix.len();
    let mid: String = mid.chars().take(available).collect();
    format!("{BUCKET_NAME_PREFIX}{mid}{suffix}")
}

/// Generates the stable per-account bucket name for a region.
#[must_use]
pub fn generate_regional_bucket_name(account_id: &str, region: &str) -> String {
    let digest = Sha256::digest(account_id.as_bytes());
    format!("{BUCKET_NAME_PREFIX}-{}-{region}", hex::encode(&digest[..16]))
}

/// A bucket templates and assets are staged into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingBucket {
    /// Bucket name.
    pub name: String,
    /// Region the bucket lives in.
    pub region: String,
    /// Owning account.
    pub account_id: String,
    /// Partition of the account.
    pub partition: String,
    /// Credential profile used to reach it.
    pub profile: String,
    /// Created by this run, and therefore removable by it.
    pub auto_generated: bool,
    /// One bucket per account and region rather than per account.
    pub regional: bool,
    /// Canned ACL for uploaded objects.
    pub object_acl: String,
    /// Deny requests not signed with signature v4.
    pub sigv4: bool,
    /// Run that owns the bucket.
    pub run_id: Uuid,
    /// Organisation granted read access, if any.
    pub org_id: Option<String>,
}

impl StagingBucket {
    /// Key under which this bucket is shared between region bindings.
    #[must_use]
    pub fn sharing_key(&self) -> String {
        if self.regional {
            format!("{}{}", self.account_id, self.region)
        } else {
            self.account_id.clone()
        }
    }

    /// Policy denying signature v2 requests.
    #[must_use]
    pub fn sigv4_policy(&self) -> String {
        serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "DenySigV2",
                "Effect": "Deny",
                "Principal": "*",
                "Action": "s3:*",
                "Resource": format!("arn:{}:s3:::{}/*", self.partition, self.name),
                "Condition": {"StringEquals": {"s3:signatureversion": "AWS"}}
            }]
        })
        .to_string()
    }

    /// Policy granting the organisation access, if one is configured.
    #[must_use]
    pub fn org_policy(&self) -> Option<String> {
        let org_id = self.org_id.as_ref()?;
        Some(
            serde_json::json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Sid": "OrganizationAccess",
                    "Effect": "Allow",
                    "Principal": "*",
                    "Action": "s3:*",
                    "Resource": format!("arn:{}:s3:::{}/*", self.partition, self.name),
                    "Condition": {"StringEquals": {"aws:PrincipalOrgID": org_id}}
                }]
            })
            .to_string(),
        )
    }

    /// URL of an object in this bucket.
    #[must_use]
    pub fn object_url(&self, key: &str) -> String {
        object_url(&self.name, &self.region, &self.partition, key)
    }

    /// Creates the bucket if it is ours to create, otherwise checks it exists.
    pub async fn ensure(&self, store: &dyn ObjectStore) -> Result<(), FleetError> {
        if !self.auto_generated {
            return match self.bucket_region(store).await? {
                Some(_) => Ok(()),
                None => Err(ConfigError::bucket(&self.name, "bucket does not exist").into()),
            };
        }

        if self.matches_existing(store).await? {
            tracing::debug!(bucket = %self.name, "Reusing existing bucket");
            return Ok(());
        }

        let location = (self.region != DEFAULT_LOCATION).then_some(self.region.as_str());
        store
            .create_bucket(&self.name, location)
            .await
            .map_err(|e| self.stage_error(e))?;
        tracing::info!(bucket = %self.name, region = %self.region, "Created staging bucket");

        if let Err(err) = self.configure(store).await {
            if let Err(cleanup) = store.delete_bucket(&self.name).await {
                tracing::warn!(bucket = %self.name, error = %cleanup, "Failed to remove bucket");
            }
            return Err(self.stage_error(err).into());
        }
        Ok(())
    }

    async fn configure(&self, store: &dyn ObjectStore) -> Result<(), CloudError> {
        if !self.regional {
            store
                .put_bucket_tagging(&self.name, &[Tag::new(RUN_ID_TAG, self.run_id.simple().to_string())])
                .await?;
        }
        if self.sigv4 {
            store.put_bucket_policy(&self.name, &self.sigv4_policy()).await?;
        }
        if let Some(policy) = self.org_policy() {
            store.put_bucket_policy(&self.name, &policy).await?;
        }
        Ok(())
    }

    async fn bucket_region(&self, store: &dyn ObjectStore) -> Result<Option<String>, FleetError> {
        store
            .bucket_region(&self.name)
            .await
            .map_err(|e| self.stage_error(e).into())
    }

    /// Returns true if the bucket already exists and belongs to this run.
    async fn matches_existing(&self, store: &dyn ObjectStore) -> Result<bool, FleetError> {
        let Some(location) = self.bucket_region(store).await? else {
            return Ok(false);
        };
        if location != self.region {
            return Err(ConfigError::bucket(
                &self.name,
                format!("exists in {location}, expected {}", self.region),
            )
            .into());
        }
        if self.regional {
            return Ok(true);
        }

        let tags = store
            .get_bucket_tagging(&self.name)
            .await
            .map_err(|e| self.stage_error(e))?;
        let expected = self.run_id.simple().to_string();
        match tags.iter().find(|t| t.key == RUN_ID_TAG) {
            Some(tag) if tag.value == expected => Ok(true),
            _ => Err(ConfigError::bucket(&self.name, "exists but belongs to a different run").into()),
        }
    }

    /// Deletes every object in an auto-generated bucket. Returns the count removed.
    pub async fn empty(&self, store: &dyn ObjectStore) -> Result<usize, StageError> {
        if !self.auto_generated {
            tracing::error!(bucket = %self.name, "Will not empty a bucket this run did not create");
            return Ok(0);
        }

        let mut keys = Vec::new();
        let mut token = None;
        loop {
            let page = store
                .list_objects(&self.name, "", token)
                .await
                .map_err(|source| StageError::List {
                    bucket: self.name.clone(),
                    prefix: String::new(),
                    source,
                })?;
            keys.extend(page.items.into_iter().map(|o| o.key));
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }

        delete_keys(store, &self.name, &keys).await?;
        Ok(keys.len())
    }

    /// Removes an auto-generated bucket, optionally emptying it first.
    pub async fn delete(&self, store: &dyn ObjectStore, delete_objects: bool) -> Result<(), TeardownError> {
        if !self.auto_generated {
            tracing::info!(bucket = %self.name, "Will not delete a bucket this run did not create");
            return Ok(());
        }
        if delete_objects {
            if let Err(err) = self.empty(store).await {
                return match err {
                    StageError::List { source, .. } if source.is_not_found() => {
                        tracing::info!(bucket = %self.name, "Bucket already gone");
                        Ok(())
                    }
                    StageError::List { source, .. } | StageError::Bucket { source, .. } => {
                        Err(TeardownError::new(&self.name, source))
                    }
                    other => Err(TeardownError::new(
                        &self.name,
                        CloudError::service("delete-objects", other.to_string()),
                    )),
                };
            }
        }
        match store.delete_bucket(&self.name).await {
            Ok(()) => {
                tracing::info!(bucket = %self.name, "Deleted staging bucket");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(bucket = %self.name, "Bucket already gone");
                Ok(())
            }
            Err(e) => Err(TeardownError::new(&self.name, e)),
        }
    }

    fn stage_error(&self, source: CloudError) -> StageError {
        StageError::Bucket {
            bucket: self.name.clone(),
            source,
        }
    }
}

/// Deletes keys in batches of [`DELETE_BATCH_SIZE`], failing if any key remains.
pub async fn delete_keys(store: &dyn ObjectStore, bucket: &str, keys: &[String]) -> Result<(), StageError> {
    let mut failed = Vec::new();
    for batch in keys.chunks(DELETE_BATCH_SIZE) {
        let errors = store
            .delete_objects(bucket, batch)
            .await
            .map_err(|source| StageError::Bucket {
                bucket: bucket.to_string(),
                source,
            })?;
        for error in errors {
            tracing::error!(bucket = %bucket, key = %error.key, message = %error.message, "Delete failed");
            failed.push(error.key);
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(StageError::Delete {
            bucket: bucket.to_string(),
            keys: failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryCloud;

    fn bucket(name: &str, region: &str) -> StagingBucket {
        StagingBucket {
            name: name.to_string(),
            region: region.to_string(),
            account_id: "123456789012".to_string(),
            partition: "aws".to_string(),
            profile: "default".to_string(),
            auto_generated: true,
            regional: false,
            object_acl: "private".to_string(),
            sigv4: true,
            run_id: Uuid::new_v4(),
            org_id: None,
        }
    }

    #[test]
    fn test_generated_name_shape() {
        let name = generate_bucket_name("my-project");
        assert!(name.starts_with("fleet-my-project-"));
        assert_eq!(name.len(), "fleet-my-project-".len() + 8);

        let long = generate_bucket_name(&"x".repeat(100));
        assert_eq!(long.len(), 63);
    }

    #[test]
    fn test_regional_name_is_stable() {
        let a = generate_regional_bucket_name("123456789012", "eu-west-1");
        let b = generate_regional_bucket_name("123456789012", "eu-west-1");
        assert_eq!(a, b);
        assert!(a.starts_with("fleet-"));
        assert!(a.ends_with("-eu-west-1"));
        assert!(a.len() <= 63);
    }

    #[test]
    fn test_policies() {
        let mut b = bucket("bkt", "us-east-1");
        assert!(b.sigv4_policy().contains("arn:aws:s3:::bkt/*"));
        assert!(b.org_policy().is_none());
        b.org_id = Some("o-abc".to_string());
        assert!(b.org_policy().unwrap().contains("o-abc"));
    }

    #[tokio::test]
    async fn test_create_omits_location_in_default_region() {
        let cloud = InMemoryCloud::new();
        let store = cloud.region_client("us-east-1");
        let b = bucket("bkt", "us-east-1");

        b.ensure(store.as_ref()).await.unwrap();
        assert_eq!(cloud.bucket_location("bkt"), Some(None));
        assert_eq!(cloud.bucket_policies("bkt").len(), 1);

        // second ensure reuses the bucket
        b.ensure(store.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_sets_location_elsewhere() {
        let cloud = InMemoryCloud::new();
        let store = cloud.region_client("eu-west-1");
        let b = bucket("bkt", "eu-west-1");

        b.ensure(store.as_ref()).await.unwrap();
        assert_eq!(cloud.bucket_location("bkt"), Some(Some("eu-west-1".to_string())));
    }

    #[tokio::test]
    async fn test_existing_bucket_other_run_rejected() {
        let cloud = InMemoryCloud::new();
        let store = cloud.region_client("us-east-1");
        bucket("bkt", "us-east-1").ensure(store.as_ref()).await.unwrap();

        let err = bucket("bkt", "us-east-1").ensure(store.as_ref()).await.unwrap_err();
        assert!(matches!(err, FleetError::Config(ConfigError::Bucket { .. })));
    }

    #[tokio::test]
    async fn test_existing_bucket_wrong_region_rejected() {
        let cloud = InMemoryCloud::new();
        cloud.create_test_bucket("bkt", "us-west-2");
        let store = cloud.region_client("us-east-1");

        let err = bucket("bkt", "us-east-1").ensure(store.as_ref()).await.unwrap_err();
        assert!(err.to_string().contains("us-west-2"));
    }

    #[tokio::test]
    async fn test_failed_configuration_removes_bucket() {
        let cloud = InMemoryCloud::new();
        cloud.fail_bucket_policies(CloudError::access_denied("put-bucket-policy", "denied"));
        let store = cloud.region_client("us-east-1");

        let err = bucket("bkt", "us-east-1").ensure(store.as_ref()).await.unwrap_err();
        assert!(matches!(err, FleetError::Stage(StageError::Bucket { .. })));
        assert_eq!(cloud.bucket_location("bkt"), None);
    }

    #[tokio::test]
    async fn test_user_bucket_must_exist() {
        let cloud = InMemoryCloud::new();
        let store = cloud.region_client("us-east-1");
        let mut b = bucket("user-bkt", "us-east-1");
        b.auto_generated = false;

        assert!(b.ensure(store.as_ref()).await.is_err());
        cloud.create_test_bucket("user-bkt", "us-east-1");
        assert!(b.ensure(store.as_ref()).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_and_delete_only_auto_generated() {
        let cloud = InMemoryCloud::new();
        let store = cloud.region_client("us-east-1");
        for i in 0..5 {
            cloud.put_test_object("user-bkt", &format!("k{i}"), b"x");
        }

        let mut user = bucket("user-bkt", "us-east-1");
        user.auto_generated = false;
        assert_eq!(user.empty(store.as_ref()).await.unwrap(), 0);
        user.delete(store.as_ref(), true).await.unwrap();
        assert_eq!(cloud.object_keys("user-bkt").len(), 5);

        let auto = bucket("user-bkt", "us-east-1");
        auto.delete(store.as_ref(), true).await.unwrap();
        assert_eq!(cloud.bucket_location("user-bkt"), None);
    }

    #[tokio::test]
    async fn test_delete_keys_batches() {
        let cloud = InMemoryCloud::new();
        let store = cloud.region_client("us-east-1");
        let keys: Vec<String> = (0..2500).map(|i| format!("k{i}")).collect();
        for key in &keys {
            cloud.put_test_object("bkt", key, b"");
        }

        delete_keys(store.as_ref(), "bkt", &keys).await.unwrap();
        assert_eq!(cloud.delete_calls(), 3);
        assert!(cloud.object_keys("bkt").is_empty());
    }
}
