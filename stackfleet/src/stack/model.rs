//! Snapshots of stack events and resources.

use super::status::{StackStatus, StatusBucket};
use crate::cloud::{ResourceSummary, StackEventRecord};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

static GENERIC_ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(The following resource\(s\) failed to create: )",
        r"(^Resource creation cancelled$)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("generic error pattern is valid"))
    .collect()
});

/// Returns true for wrapper messages that only point at another failure.
#[must_use]
pub fn is_generic_reason(reason: &str) -> bool {
    GENERIC_ERROR_PATTERNS.iter().any(|re| re.is_match(reason))
}

/// One stack event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event id.
    pub event_id: String,
    /// Stack the event belongs to.
    pub stack_id: String,
    /// Logical resource id.
    pub logical_id: String,
    /// Physical resource id, empty if not yet assigned.
    pub physical_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Resource status.
    pub status: StackStatus,
    /// Status reason, empty if none.
    pub status_reason: String,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Decoded resource properties.
    pub properties: Map<String, Value>,
}

impl Event {
    /// Returns true if the reason is a generic wrapper message.
    #[must_use]
    pub fn is_generic(&self) -> bool {
        is_generic_reason(&self.status_reason)
    }

    /// Returns true for failed-class events.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.bucket() == StatusBucket::Failed
    }

    /// The `TemplateURL` property of a nested stack event.
    #[must_use]
    pub fn template_url(&self) -> Option<&str> {
        self.properties.get("TemplateURL").and_then(Value::as_str)
    }
}

impl From<StackEventRecord> for Event {
    fn from(record: StackEventRecord) -> Self {
        let properties = match record.resource_properties.as_deref() {
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => Map::new(),
                Err(e) => {
                    tracing::debug!(event_id = %record.event_id, error = %e, "Unparseable resource properties");
                    Map::new()
                }
            },
            None => Map::new(),
        };
        Self {
            event_id: record.event_id,
            stack_id: record.stack_id,
            logical_id: record.logical_id,
            physical_id: record.physical_id,
            resource_type: record.resource_type,
            status: StackStatus::parse(&record.status),
            status_reason: record.status_reason.unwrap_or_default(),
            timestamp: record.timestamp,
            properties,
        }
    }
}

/// One physical resource of a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Owning stack.
    pub stack_id: String,
    /// Test the owning stack belongs to.
    pub test_name: String,
    /// Logical resource id.
    pub logical_id: String,
    /// Physical resource id.
    pub physical_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Resource status.
    pub status: StackStatus,
    /// Status reason, empty if none.
    pub status_reason: String,
    /// Last update time.
    pub last_updated: DateTime<Utc>,
}

impl Resource {
    /// Builds a resource from a listing entry.
    #[must_use]
    pub fn from_summary(stack_id: &str, test_name: &str, summary: ResourceSummary) -> Self {
        Self {
            stack_id: stack_id.to_string(),
            test_name: test_name.to_string(),
            logical_id: summary.logical_id,
            physical_id: summary.physical_id,
            resource_type: summary.resource_type,
            status: StackStatus::parse(&summary.status),
            status_reason: summary.status_reason.unwrap_or_default(),
            last_updated: summary.last_updated,
        }
    }
}
