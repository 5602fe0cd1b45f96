//! Error types for stackfleet.
//!
//! The taxonomy follows the lifecycle of a run: configuration problems are
//! caught before any cloud call, render and stage errors abort the run,
//! stack failures are collected across the whole fleet and raised once, and
//! teardown errors are reported without masking the original outcome.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The main error type for stackfleet operations.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Malformed or missing configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A template could not be loaded or inspected.
    #[error("{0}")]
    Template(#[from] TemplateError),

    /// A parameter directive could not be evaluated.
    #[error("{0}")]
    Render(#[from] RenderError),

    /// Object storage synchronisation failed.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// One or more stacks ended in a failed state.
    #[error("{0}")]
    StackFailure(#[from] StackFailureError),

    /// A delete call was rejected.
    #[error("{0}")]
    Teardown(#[from] TeardownError),

    /// A cloud API call failed outside of a more specific context.
    #[error("{0}")]
    Cloud(#[from] CloudError),

    /// A task panicked or was aborted.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Returns the short class name used in reports.
    #[must_use]
    pub fn class(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Template(_) => "TemplateError",
            Self::Render(_) => "RenderError",
            Self::Stage(_) => "StageError",
            Self::StackFailure(_) => "StackFailure",
            Self::Teardown(_) => "TeardownError",
            Self::Cloud(_) => "CloudError",
            Self::Internal(_) => "InternalError",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.class()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Self::StackFailure(failure) = self {
            map.insert(
                "failed".to_string(),
                serde_json::to_value(&failure.failed).unwrap_or_default(),
            );
        }
        map
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Broad classification of a cloud provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudErrorKind {
    /// The caller is not authorised for the operation.
    AccessDenied,
    /// The provider throttled the request.
    Throttled,
    /// The addressed entity does not exist.
    NotFound,
    /// A transient transport or session bootstrap failure.
    Transient,
    /// The request itself was malformed.
    InvalidRequest,
    /// Any other service-side failure.
    Service,
}

impl fmt::Display for CloudErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessDenied => write!(f, "access denied"),
            Self::Throttled => write!(f, "throttled"),
            Self::NotFound => write!(f, "not found"),
            Self::Transient => write!(f, "transient"),
            Self::InvalidRequest => write!(f, "invalid request"),
            Self::Service => write!(f, "service error"),
        }
    }
}

/// A failed cloud API call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct CloudError {
    /// The failure class.
    pub kind: CloudErrorKind,
    /// The API operation, e.g. "create-stack".
    pub operation: String,
    /// Provider supplied message.
    pub message: String,
}

impl CloudError {
    /// Creates a new cloud error.
    #[must_use]
    pub fn new(kind: CloudErrorKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an access denied error.
    #[must_use]
    pub fn access_denied(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::AccessDenied, operation, message)
    }

    /// Creates a throttling error.
    #[must_use]
    pub fn throttled(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Throttled, operation, message)
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::NotFound, operation, message)
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Transient, operation, message)
    }

    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid_request(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::InvalidRequest, operation, message)
    }

    /// Creates a generic service error.
    #[must_use]
    pub fn service(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Service, operation, message)
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, CloudErrorKind::Throttled | CloudErrorKind::Transient)
    }

    /// Returns true for authorization failures.
    #[must_use]
    pub fn is_access_denied(&self) -> bool {
        self.kind == CloudErrorKind::AccessDenied
    }

    /// Returns true when the addressed entity does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == CloudErrorKind::NotFound
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind));
        map.insert("operation".to_string(), serde_json::json!(self.operation));
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));
        map
    }
}

/// Malformed or missing configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A required field is absent.
    #[error("Missing required field '{field}' in {scope}")]
    MissingField {
        /// The field name.
        field: String,
        /// Where it was expected, e.g. "test 'default'".
        scope: String,
    },

    /// A field holds a value that fails validation.
    #[error("Invalid value for '{field}': '{value}' ({reason})")]
    InvalidValue {
        /// The field name.
        field: String,
        /// The offending value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    /// A configuration file could not be read.
    #[error("Failed to read {}: {reason}", path.display())]
    FileRead {
        /// The file path.
        path: PathBuf,
        /// The underlying reason.
        reason: String,
    },

    /// A configuration file could not be parsed.
    #[error("Failed to parse {}: {reason}", path.display())]
    Parse {
        /// The file path.
        path: PathBuf,
        /// The underlying reason.
        reason: String,
    },

    /// A test references a template that does not exist.
    #[error("Template for test '{test}' not found at {}", path.display())]
    TemplateNotFound {
        /// The test name.
        test: String,
        /// The resolved path.
        path: PathBuf,
    },

    /// Mutually exclusive options were combined.
    #[error("Conflicting options: {0}")]
    Conflict(String),

    /// A bucket exists but cannot be used for this run.
    #[error("Bucket '{bucket}' cannot be used: {reason}")]
    Bucket {
        /// The bucket name.
        bucket: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Creates a missing field error.
    #[must_use]
    pub fn missing_field(field: impl Into<String>, scope: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
            scope: scope.into(),
        }
    }

    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Creates a file read error.
    #[must_use]
    pub fn file_read(path: &Path, reason: impl fmt::Display) -> Self {
        Self::FileRead {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Creates a parse error.
    #[must_use]
    pub fn parse(path: &Path, reason: impl fmt::Display) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Creates a bucket rejection error.
    #[must_use]
    pub fn bucket(bucket: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Bucket {
            bucket: bucket.into(),
            reason: reason.into(),
        }
    }
}

/// A template could not be loaded or inspected.
#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    /// The template file could not be read.
    #[error("Failed to read template {}: {reason}", path.display())]
    Read {
        /// The template path.
        path: PathBuf,
        /// The underlying reason.
        reason: String,
    },

    /// The template body is not valid YAML/JSON.
    #[error("Failed to parse template {}: {reason}", path.display())]
    Parse {
        /// The template path.
        path: PathBuf,
        /// The underlying reason.
        reason: String,
    },

    /// The template has no Resources section.
    #[error("Invalid template {}: no Resources section", path.display())]
    MissingResources {
        /// The template path.
        path: PathBuf,
    },

    /// A nested stack reference did not resolve to a local file.
    #[error("Nested stack '{resource}' in {} references {reference}, but {} does not exist", parent.display(), candidate.display())]
    ChildNotFound {
        /// The parent template.
        parent: PathBuf,
        /// The logical id of the nested stack resource.
        resource: String,
        /// The raw template reference.
        reference: String,
        /// The local path that was tried.
        candidate: PathBuf,
    },

    /// A nested stack reference cannot be interpreted.
    #[error("Nested stack '{resource}' in {} has an unsupported TemplateURL: {reference}", parent.display())]
    UnsupportedReference {
        /// The parent template.
        parent: PathBuf,
        /// The logical id of the nested stack resource.
        resource: String,
        /// The raw template reference.
        reference: String,
    },

    /// Structural lint reported errors.
    #[error("Lint failed for {}: {}", path.display(), findings.join("; "))]
    Lint {
        /// The root template of the test.
        path: PathBuf,
        /// One message per error finding.
        findings: Vec<String>,
    },

    /// Nested stack references form a cycle.
    #[error("Nested stack cycle detected: {}", chain.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" -> "))]
    Cycle {
        /// The templates forming the cycle, first element repeated at the end.
        chain: Vec<PathBuf>,
    },
}

/// A parameter directive could not be evaluated.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// A parameter has no value at all.
    #[error("Parameter '{param}' has no value; the stack would fail to launch")]
    MissingValue {
        /// The parameter name.
        param: String,
    },

    /// A `getval` directive referenced a parameter not yet rendered.
    #[error("Parameter '{param}' references '{referenced}' which has not been rendered yet")]
    ForwardReference {
        /// The referencing parameter.
        param: String,
        /// The referenced parameter.
        referenced: String,
    },

    /// Fewer availability zones are available than requested.
    #[error("Only {available} availability zones are available in {region}, {requested} requested")]
    InsufficientZones {
        /// The region.
        region: String,
        /// The requested count.
        requested: usize,
        /// The count left after exclusions.
        available: usize,
    },

    /// A directive is syntactically wrong.
    #[error("Malformed directive in parameter '{param}': {reason}")]
    MalformedDirective {
        /// The parameter name.
        param: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A cloud lookup performed for a directive failed.
    #[error("Lookup for parameter '{param}' failed: {source}")]
    Lookup {
        /// The parameter name.
        param: String,
        /// The underlying cloud error.
        source: CloudError,
    },
}

impl RenderError {
    /// Creates a forward reference error.
    #[must_use]
    pub fn forward_reference(param: impl Into<String>, referenced: impl Into<String>) -> Self {
        Self::ForwardReference {
            param: param.into(),
            referenced: referenced.into(),
        }
    }

    /// Creates a malformed directive error.
    #[must_use]
    pub fn malformed(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedDirective {
            param: param.into(),
            reason: reason.into(),
        }
    }

    /// Creates a lookup error.
    #[must_use]
    pub fn lookup(param: impl Into<String>, source: CloudError) -> Self {
        Self::Lookup {
            param: param.into(),
            source,
        }
    }
}

/// Object storage synchronisation failed.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// The local tree could not be walked or hashed.
    #[error("Failed to read local file {}: {reason}", path.display())]
    Local {
        /// The local path.
        path: PathBuf,
        /// The underlying reason.
        reason: String,
    },

    /// Listing remote objects failed.
    #[error("Failed to list s3://{bucket}/{prefix}: {source}")]
    List {
        /// The bucket.
        bucket: String,
        /// The key prefix.
        prefix: String,
        /// The underlying cloud error.
        source: CloudError,
    },

    /// An upload failed after exhausting retries, or was not retryable.
    #[error("Failed to upload s3://{bucket}/{key} after {attempts} attempt(s): {source}")]
    Upload {
        /// The bucket.
        bucket: String,
        /// The object key.
        key: String,
        /// Attempts made.
        attempts: usize,
        /// The last cloud error.
        source: CloudError,
    },

    /// One or more objects could not be deleted.
    #[error("Failed to delete {} object(s) from {bucket}: {}", keys.len(), keys.join(", "))]
    Delete {
        /// The bucket.
        bucket: String,
        /// Keys that failed.
        keys: Vec<String>,
    },

    /// A bucket-level call failed.
    #[error("Bucket operation on {bucket} failed: {source}")]
    Bucket {
        /// The bucket.
        bucket: String,
        /// The underlying cloud error.
        source: CloudError,
    },
}

impl StageError {
    /// Creates a local file error.
    #[must_use]
    pub fn local(path: &Path, reason: impl fmt::Display) -> Self {
        Self::Local {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Summary of one stack that ended in the FAILED bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStack {
    /// Fully-qualified stack id.
    pub stack_id: String,
    /// Test the stack belongs to.
    pub test_name: String,
    /// Region the stack was launched in.
    pub region: String,
    /// Terminal status.
    pub status: String,
    /// Status reason, if any.
    pub reason: String,
}

/// One or more stacks terminated in a FAILED-class state.
#[derive(Debug, Clone, Error)]
#[error("{} stack(s) failed to create: {}", failed.len(), failed.iter().map(|f| format!("{} ({})", f.stack_id, f.status)).collect::<Vec<_>>().join(", "))]
pub struct StackFailureError {
    /// Every failed stack in the fleet.
    pub failed: Vec<FailedStack>,
}

impl StackFailureError {
    /// Creates a new stack failure error.
    #[must_use]
    pub fn new(failed: Vec<FailedStack>) -> Self {
        Self { failed }
    }
}

/// A teardown call was rejected.
#[derive(Debug, Clone, Error)]
#[error("Teardown of {target} failed: {source}")]
pub struct TeardownError {
    /// Stack id or bucket name.
    pub target: String,
    /// The underlying cloud error.
    pub source: CloudError,
}

impl TeardownError {
    /// Creates a new teardown error.
    #[must_use]
    pub fn new(target: impl Into<String>, source: CloudError) -> Self {
        Self {
            target: target.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_error_retryable() {
        assert!(CloudError::throttled("describe-stacks", "Rate exceeded").is_retryable());
        assert!(CloudError::transient("put-object", "connection reset").is_retryable());
        assert!(!CloudError::access_denied("put-object", "AccessDenied").is_retryable());
        assert!(!CloudError::invalid_request("create-stack", "bad").is_retryable());
    }

    #[test]
    fn test_cloud_error_display() {
        let err = CloudError::not_found("get-object", "NoSuchKey");
        assert_eq!(err.to_string(), "get-object failed (not found): NoSuchKey");
    }

    #[test]
    fn test_cloud_error_to_dict() {
        let dict = CloudError::throttled("list-objects", "slow down").to_dict();
        assert_eq!(dict.get("kind").unwrap(), "throttled");
        assert_eq!(dict.get("retryable").unwrap(), true);
    }

    #[test]
    fn test_render_error_forward_reference() {
        let err = RenderError::forward_reference("B", "C");
        assert!(err.to_string().contains("'C'"));
    }

    #[test]
    fn test_stack_failure_lists_every_stack() {
        let err = StackFailureError::new(vec![
            FailedStack {
                stack_id: "stack-a".to_string(),
                test_name: "t".to_string(),
                region: "us-east-1".to_string(),
                status: "CREATE_FAILED".to_string(),
                reason: String::new(),
            },
            FailedStack {
                stack_id: "stack-b".to_string(),
                test_name: "t".to_string(),
                region: "us-west-2".to_string(),
                status: "ROLLBACK_COMPLETE".to_string(),
                reason: String::new(),
            },
        ]);

        let message = err.to_string();
        assert!(message.starts_with("2 stack(s) failed"));
        assert!(message.contains("stack-a (CREATE_FAILED)"));
        assert!(message.contains("stack-b (ROLLBACK_COMPLETE)"));
    }

    #[test]
    fn test_fleet_error_to_dict() {
        let err = FleetError::from(ConfigError::missing_field("template", "test 'default'"));
        let dict = err.to_dict();
        assert_eq!(dict.get("type").unwrap(), "ConfigError");
    }

    #[test]
    fn test_template_cycle_display() {
        let err = TemplateError::Cycle {
            chain: vec![
                PathBuf::from("a.yaml"),
                PathBuf::from("b.yaml"),
                PathBuf::from("a.yaml"),
            ],
        };
        assert!(err.to_string().contains("a.yaml -> b.yaml -> a.yaml"));
    }
}
