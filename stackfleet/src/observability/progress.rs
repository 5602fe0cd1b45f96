//! Progress sink trait and implementations.

use crate::stack::{StackStatus, StatusBucket};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Level};

/// Something worth telling the operator while a run progresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The project tree was synchronised into a bucket.
    ProjectStaged {
        /// Bucket name.
        bucket: String,
        /// Files uploaded.
        uploaded: usize,
        /// Remote objects removed.
        deleted: usize,
    },
    /// A root stack was launched.
    StackCreated {
        /// Stack id.
        stack_id: String,
        /// Owning test.
        test_name: String,
        /// Region.
        region: String,
    },
    /// A stack moved to a new status.
    StatusChanged {
        /// Stack id.
        stack_id: String,
        /// Owning test.
        test_name: String,
        /// Region.
        region: String,
        /// New status.
        status: StackStatus,
        /// Bucket of the new status.
        bucket: StatusBucket,
    },
    /// Fleet-wide counts after a polling round.
    FleetStatus {
        /// Stacks in the COMPLETE bucket.
        complete: usize,
        /// Stacks still in progress.
        in_progress: usize,
        /// Stacks in the FAILED bucket.
        failed: usize,
    },
    /// A delete was requested for a stack.
    StackDeleted {
        /// Stack id.
        stack_id: String,
        /// Region.
        region: String,
    },
    /// The run finished.
    RunFinished {
        /// Stacks in the COMPLETE bucket.
        complete: usize,
        /// Stacks in the FAILED bucket.
        failed: usize,
    },
}

impl ProgressEvent {
    /// Dotted event name, e.g. `stack.created`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ProjectStaged { .. } => "project.staged",
            Self::StackCreated { .. } => "stack.created",
            Self::StatusChanged { .. } => "stack.status_changed",
            Self::FleetStatus { .. } => "fleet.status",
            Self::StackDeleted { .. } => "stack.deleted",
            Self::RunFinished { .. } => "run.finished",
        }
    }
}

/// Receives progress events.
///
/// Sinks must not fail the run; errors are logged and suppressed.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event: ProgressEvent);

    /// Emits an event without awaiting.
    fn try_emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressSink;

#[async_trait]
impl ProgressSink for NoOpProgressSink {
    async fn emit(&self, _event: ProgressEvent) {}

    fn try_emit(&self, _event: ProgressEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingProgressSink {
    level: Level,
}

impl Default for LoggingProgressSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingProgressSink {
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log(&self, event: &ProgressEvent) {
        let event_type = event.event_type();
        match event {
            ProgressEvent::StatusChanged {
                stack_id,
                status,
                bucket: StatusBucket::Failed,
                ..
            } => {
                warn!(event_type, stack_id = %stack_id, status = %status, "Stack failed");
            }
            ProgressEvent::FleetStatus {
                complete,
                in_progress,
                failed,
            } => {
                info!(event_type, complete, in_progress, failed, "Fleet status");
            }
            _ if self.level == Level::DEBUG => {
                debug!(event_type, event = ?event, "Progress");
            }
            _ => {
                info!(event_type, event = ?event, "Progress");
            }
        }
    }
}

#[async_trait]
impl ProgressSink for LoggingProgressSink {
    async fn emit(&self, event: ProgressEvent) {
        self.log(&event);
    }

    fn try_emit(&self, event: ProgressEvent) {
        self.log(&event);
    }
}

/// Records events for inspection in tests.
#[derive(Debug, Default)]
pub struct CollectingProgressSink {
    events: parking_lot::RwLock<Vec<ProgressEvent>>,
}

impl CollectingProgressSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProgressSink for CollectingProgressSink {
    async fn emit(&self, event: ProgressEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: ProgressEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> ProgressEvent {
        ProgressEvent::StackCreated {
            stack_id: "s-1".to_string(),
            test_name: "t".to_string(),
            region: "us-east-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_logging_sink_does_not_panic() {
        let sink = LoggingProgressSink::debug();
        sink.emit(created()).await;
        sink.try_emit(ProgressEvent::FleetStatus {
            complete: 1,
            in_progress: 0,
            failed: 0,
        });
    }

    #[tokio::test]
    async fn test_collecting_sink_filters_by_type() {
        let sink = CollectingProgressSink::new();
        assert!(sink.is_empty());
        sink.emit(created()).await;
        sink.try_emit(ProgressEvent::StackDeleted {
            stack_id: "s-1".to_string(),
            region: "us-east-1".to_string(),
        });
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_of_type("stack.created"), vec![created()]);
        assert_eq!(sink.events_of_type("stack.").len(), 2);
    }

    #[test]
    fn test_event_serialises_with_type_tag() {
        let value = serde_json::to_value(created()).unwrap();
        assert_eq!(value["type"], "stack_created");
        assert_eq!(value["region"], "us-east-1");
    }
}
