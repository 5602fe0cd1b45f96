//! Content-addressed synchronisation of a project tree to object storage.
//!
//! Local files are compared with remote objects by ETag, so unchanged
//! files are never re-uploaded and a second sync of an unchanged tree makes
//! no writes at all.

use super::bucket::{delete_keys, StagingBucket};
use super::checksum::{content_md5, etag_of_file, PART_SIZE};
use crate::cloud::{ClientCache, ObjectStore, PutObjectRequest};
use crate::errors::{CloudError, StageError};
use crate::retry::{with_retry_if, RetryConfig, RetryExhausted};
use futures::stream::{self, StreamExt, TryStreamExt};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

/// Project configuration file name, never uploaded.
pub const CONFIG_FILE_NAME: &str = ".stackfleet.yml";

/// Directory run reports are written to.
pub const OUTPUTS_DIR: &str = "stackfleet_outputs/";

const EXCLUDED_FILES: &[&str] = &[".*", "*.md"];

static EXCLUDED_FILE_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    EXCLUDED_FILES
        .iter()
        .map(|pattern| Pattern::new(pattern).expect("exclusion pattern is valid"))
        .collect()
});

static CONFIG_FILE_PATTERN: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![Pattern::new(&Pattern::escape(CONFIG_FILE_NAME)).expect("escaped pattern is valid")]
});
const EXCLUDED_PREFIXES: &[&str] = &[
    "lambda_functions/source/",
    "functions/source/",
    ".",
    "venv/",
    OUTPUTS_DIR,
];

/// Options for [`AssetStager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Canned ACL applied to uploads.
    pub acl: String,
    /// Concurrent upload workers.
    pub workers: usize,
    /// Extra path prefixes excluded locally and protected remotely.
    pub exclusions: Vec<String>,
    /// Remote path prefixes never deleted.
    pub remote_exclusions: Vec<String>,
    /// Upload everything except the project config file.
    pub all_files: bool,
    /// Retry policy for each upload.
    pub retry: RetryConfig,
    /// Multipart part size used for checksums.
    pub part_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            acl: "private".to_string(),
            workers: 16,
            exclusions: Vec::new(),
            remote_exclusions: Vec::new(),
            all_files: false,
            retry: RetryConfig::uploads(),
            part_size: PART_SIZE,
        }
    }
}

impl SyncOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the object ACL.
    #[must_use]
    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = acl.into();
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Adds a path prefix excluded locally and kept remotely.
    #[must_use]
    pub fn with_exclusion(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.remote_exclusions.push(prefix.clone());
        self.exclusions.push(prefix);
        self
    }

    /// Uploads every file except the project config.
    #[must_use]
    pub fn with_all_files(mut self, all_files: bool) -> Self {
        self.all_files = all_files;
        self
    }

    /// Sets the upload retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the checksum part size.
    #[must_use]
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    fn excluded_files(&self) -> &'static [Pattern] {
        if self.all_files {
            &CONFIG_FILE_PATTERN
        } else {
            &EXCLUDED_FILE_PATTERNS
        }
    }

    fn excluded_prefixes(&self) -> Vec<&str> {
        if self.all_files {
            return Vec::new();
        }
        EXCLUDED_PREFIXES
            .iter()
            .copied()
            .chain(self.exclusions.iter().map(String::as_str))
            .collect()
    }

    fn is_remote_excluded(&self, relative: &str) -> bool {
        !self.all_files
            && self
                .remote_exclusions
                .iter()
                .any(|prefix| relative.starts_with(prefix.as_str()))
    }
}

/// Result of one sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Files uploaded.
    pub uploaded: usize,
    /// Remote objects deleted.
    pub deleted: usize,
    /// Files already up to date.
    pub unchanged: usize,
}

/// A local file eligible for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Quoted ETag.
    pub etag: String,
}

/// Walks `root`, returning eligible files keyed by `/`-separated relative path.
pub fn local_files(root: &Path, options: &SyncOptions) -> Result<BTreeMap<String, LocalFile>, StageError> {
    let excluded_files = options.excluded_files();
    let excluded_prefixes = options.excluded_prefixes();
    let mut files = BTreeMap::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, relative)) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| StageError::local(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StageError::local(&dir, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().map_err(|e| StageError::local(&path, e))?;

            if file_type.is_dir() {
                let child = format!("{relative}{name}/");
                if !excluded_prefixes.iter().any(|p| child.starts_with(p)) {
                    pending.push((path, child));
                }
                continue;
            }
            if is_excluded_file(excluded_files, &name) {
                continue;
            }

            let etag = etag_of_file(&path, options.part_size).map_err(|e| StageError::local(&path, e))?;
            files.insert(format!("{relative}{name}"), LocalFile { path, etag });
        }
    }
    Ok(files)
}

fn is_excluded_file(patterns: &[Pattern], name: &str) -> bool {
    patterns.iter().any(|pattern| pattern.matches(name))
}

/// Synchronises local trees into one object store.
pub struct AssetStager {
    store: Arc<dyn ObjectStore>,
    options: SyncOptions,
}

impl AssetStager {
    /// Creates a stager over a store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, options: SyncOptions) -> Self {
        Self { store, options }
    }

    /// Returns the options.
    #[must_use]
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Makes `bucket/prefix` mirror `root`.
    pub async fn sync(&self, root: &Path, bucket: &str, prefix: &str) -> Result<SyncReport, StageError> {
        let prefix = normalize_prefix(prefix);

        let walk_root = root.to_path_buf();
        let options = self.options.clone();
        let local = tokio::task::spawn_blocking(move || local_files(&walk_root, &options))
            .await
            .map_err(|e| StageError::local(root, e))??;
        let remote = self.remote_etags(bucket, &prefix).await?;

        let stale: Vec<String> = remote
            .keys()
            .filter(|relative| !local.contains_key(*relative) && !self.options.is_remote_excluded(relative))
            .map(|relative| format!("{prefix}{relative}"))
            .collect();
        for key in &stale {
            tracing::info!(bucket = %bucket, key = %key, "Deleting stale object");
        }
        delete_keys(self.store.as_ref(), bucket, &stale).await?;

        let mut report = SyncReport {
            deleted: stale.len(),
            ..SyncReport::default()
        };
        let changed: Vec<(String, LocalFile)> = local
            .into_iter()
            .filter(|(relative, file)| {
                let unchanged = remote.get(relative) == Some(&file.etag);
                if unchanged {
                    report.unchanged += 1;
                }
                !unchanged
            })
            .collect();

        let uploaded = AtomicUsize::new(0);
        let prefix = prefix.as_str();
        let uploaded_ref = &uploaded;
        stream::iter(changed.into_iter().map(Ok::<_, StageError>))
            .try_for_each_concurrent(self.options.workers.max(1), |(relative, file)| async move {
                self.upload(bucket, &format!("{prefix}{relative}"), &file).await?;
                uploaded_ref.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .await?;

        report.uploaded = uploaded.into_inner();
        tracing::info!(
            bucket = %bucket,
            prefix = %prefix,
            uploaded = report.uploaded,
            deleted = report.deleted,
            unchanged = report.unchanged,
            "Sync complete"
        );
        Ok(report)
    }

    async fn remote_etags(&self, bucket: &str, prefix: &str) -> Result<HashMap<String, String>, StageError> {
        let mut etags = HashMap::new();
        let mut token = None;
        loop {
            let page = self
                .store
                .list_objects(bucket, prefix, token)
                .await
                .map_err(|source| StageError::List {
                    bucket: bucket.to_string(),
                    prefix: prefix.to_string(),
                    source,
                })?;
            for object in page.items {
                let relative = object.key.strip_prefix(prefix).unwrap_or(&object.key).to_string();
                etags.insert(relative, object.etag);
            }
            token = page.next_token;
            if token.is_none() {
                return Ok(etags);
            }
        }
    }

    async fn upload(&self, bucket: &str, key: &str, file: &LocalFile) -> Result<(), StageError> {
        let body = tokio::fs::read(&file.path)
            .await
            .map_err(|e| StageError::local(&file.path, e))?;
        let md5 = (body.len() <= self.options.part_size).then(|| content_md5(&body));

        with_retry_if(
            &self.options.retry,
            key,
            || {
                tracing::info!(bucket = %bucket, key = %key, "Uploading");
                self.store.put_object(PutObjectRequest {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    body: body.clone(),
                    acl: self.options.acl.clone(),
                    content_md5: md5.clone(),
                    part_size: self.options.part_size,
                })
            },
            |e: &CloudError| !e.is_access_denied(),
        )
        .await
        .map_err(|RetryExhausted { attempts, error }| {
            tracing::error!(bucket = %bucket, key = %key, attempts, error = %error, "Upload failed");
            StageError::Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                attempts,
                source: error,
            }
        })
    }
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

/// Stages `project_root` under `prefix` into every distinct bucket concurrently.
pub async fn stage_project(
    cache: &ClientCache,
    buckets: &[StagingBucket],
    project_root: &Path,
    prefix: &str,
    options: &SyncOptions,
) -> Result<Vec<(String, SyncReport)>, StageError> {
    let mut distinct: BTreeMap<(String, String), &StagingBucket> = BTreeMap::new();
    for bucket in buckets {
        distinct
            .entry((bucket.name.clone(), bucket.partition.clone()))
            .or_insert(bucket);
    }

    let syncs = distinct.into_values().map(|bucket| async move {
        let store = cache
            .objects(&bucket.profile, &bucket.region)
            .await
            .map_err(|source| StageError::Bucket {
                bucket: bucket.name.clone(),
                source,
            })?;
        let stager = AssetStager::new(store, options.clone().with_acl(bucket.object_acl.clone()));
        let report = stager.sync(project_root, &bucket.name, prefix).await?;
        Ok::<_, StageError>((bucket.name.clone(), report))
    });

    stream::iter(syncs).buffer_unordered(32).try_collect().await
}
