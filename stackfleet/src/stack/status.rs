//! Stack status values and their reporting buckets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason attached to a stack whose COMPLETE status was never preceded by a
/// successful launch.
pub const OUT_OF_ORDER_REASON: &str =
    "COMPLETE event not detected. Potential out-of-band action against the stack.";

/// Reporting bucket of a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusBucket {
    /// The stack settled successfully.
    Complete,
    /// The stack is still changing.
    InProgress,
    /// The stack settled in, or is heading to, a failed state.
    Failed,
}

impl fmt::Display for StatusBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "COMPLETE"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Status of a stack or stack resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StackStatus {
    /// CREATE_IN_PROGRESS
    #[default]
    CreateInProgress,
    /// CREATE_COMPLETE
    CreateComplete,
    /// CREATE_FAILED
    CreateFailed,
    /// DELETE_IN_PROGRESS
    DeleteInProgress,
    /// DELETE_COMPLETE
    DeleteComplete,
    /// DELETE_FAILED
    DeleteFailed,
    /// ROLLBACK_IN_PROGRESS
    RollbackInProgress,
    /// ROLLBACK_FAILED
    RollbackFailed,
    /// ROLLBACK_COMPLETE
    RollbackComplete,
    /// UPDATE_IN_PROGRESS
    UpdateInProgress,
    /// UPDATE_COMPLETE
    UpdateComplete,
    /// UPDATE_COMPLETE_CLEANUP_IN_PROGRESS
    UpdateCompleteCleanupInProgress,
    /// UPDATE_ROLLBACK_IN_PROGRESS
    UpdateRollbackInProgress,
    /// UPDATE_ROLLBACK_FAILED
    UpdateRollbackFailed,
    /// UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS
    UpdateRollbackCompleteCleanupInProgress,
    /// UPDATE_ROLLBACK_COMPLETE
    UpdateRollbackComplete,
    /// A COMPLETE status observed without a preceding successful launch.
    OutOfOrderEvent,
    /// Any status not listed above.
    Other(String),
}

impl StackStatus {
    const KNOWN: [(&'static str, Self); 17] = [
        ("CREATE_IN_PROGRESS", Self::CreateInProgress),
        ("CREATE_COMPLETE", Self::CreateComplete),
        ("CREATE_FAILED", Self::CreateFailed),
        ("DELETE_IN_PROGRESS", Self::DeleteInProgress),
        ("DELETE_COMPLETE", Self::DeleteComplete),
        ("DELETE_FAILED", Self::DeleteFailed),
        ("ROLLBACK_IN_PROGRESS", Self::RollbackInProgress),
        ("ROLLBACK_FAILED", Self::RollbackFailed),
        ("ROLLBACK_COMPLETE", Self::RollbackComplete),
        ("UPDATE_IN_PROGRESS", Self::UpdateInProgress),
        ("UPDATE_COMPLETE", Self::UpdateComplete),
        ("UPDATE_COMPLETE_CLEANUP_IN_PROGRESS", Self::UpdateCompleteCleanupInProgress),
        ("UPDATE_ROLLBACK_IN_PROGRESS", Self::UpdateRollbackInProgress),
        ("UPDATE_ROLLBACK_FAILED", Self::UpdateRollbackFailed),
        (
            "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS",
            Self::UpdateRollbackCompleteCleanupInProgress,
        ),
        ("UPDATE_ROLLBACK_COMPLETE", Self::UpdateRollbackComplete),
        ("OUT_OF_ORDER_EVENT", Self::OutOfOrderEvent),
    ];

    /// Parses a raw provider status.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self::KNOWN
            .iter()
            .find(|(name, _)| *name == raw)
            .map_or_else(|| Self::Other(raw.to_string()), |(_, status)| status.clone())
    }

    /// Returns the provider spelling.
    #[must_use]
    pub fn as_str(&self) -> &str {
        if let Self::Other(raw) = self {
            return raw;
        }
        Self::KNOWN
            .iter()
            .find(|(_, status)| status == self)
            .map_or("", |(name, _)| name)
    }

    /// Classifies the status for reporting.
    #[must_use]
    pub fn bucket(&self) -> StatusBucket {
        match self {
            Self::CreateComplete | Self::UpdateComplete | Self::DeleteComplete => StatusBucket::Complete,
            Self::CreateInProgress
            | Self::DeleteInProgress
            | Self::UpdateInProgress
            | Self::UpdateCompleteCleanupInProgress => StatusBucket::InProgress,
            Self::Other(raw) => {
                if raw.contains("FAILED") || raw.contains("ROLLBACK") {
                    StatusBucket::Failed
                } else if raw.ends_with("_COMPLETE") {
                    StatusBucket::Complete
                } else {
                    StatusBucket::InProgress
                }
            }
            _ => StatusBucket::Failed,
        }
    }

    /// Returns true once the status will not change without a new request.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.bucket() != StatusBucket::InProgress
            && !matches!(
                self,
                Self::RollbackInProgress
                    | Self::UpdateRollbackInProgress
                    | Self::UpdateRollbackCompleteCleanupInProgress
            )
    }

    /// Returns true for statuses that prove the stack launched.
    #[must_use]
    pub fn is_launch_success(&self) -> bool {
        self.bucket() == StatusBucket::Complete && *self != Self::DeleteComplete
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for StackStatus {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&str> for StackStatus {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<StackStatus> for String {
    fn from(status: StackStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Tracks whether a stack ever launched successfully.
///
/// A COMPLETE status seen without a prior successful launch is rewritten to
/// [`StackStatus::OutOfOrderEvent`], so deleting a failed stack never turns
/// it into a success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchTracker {
    launch_succeeded: bool,
}

impl LaunchTracker {
    /// Creates a tracker that has not seen a launch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once CREATE_COMPLETE or UPDATE_COMPLETE was observed.
    #[must_use]
    pub fn launch_succeeded(&self) -> bool {
        self.launch_succeeded
    }

    /// Records an observed status and returns the status to report.
    pub fn observe(&mut self, status: StackStatus) -> (StackStatus, Option<&'static str>) {
        match status.bucket() {
            StatusBucket::Failed => self.launch_succeeded = false,
            StatusBucket::Complete if status.is_launch_success() => self.launch_succeeded = true,
            _ => {}
        }
        if status.bucket() == StatusBucket::Complete && !self.launch_succeeded {
            return (StackStatus::OutOfOrderEvent, Some(OUT_OF_ORDER_REASON));
        }
        (status, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        for raw in ["CREATE_COMPLETE", "UPDATE_COMPLETE", "DELETE_COMPLETE"] {
            assert_eq!(StackStatus::parse(raw).bucket(), StatusBucket::Complete, "{raw}");
        }
        for raw in [
            "CREATE_IN_PROGRESS",
            "DELETE_IN_PROGRESS",
            "UPDATE_IN_PROGRESS",
            "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
        ] {
            assert_eq!(StackStatus::parse(raw).bucket(), StatusBucket::InProgress, "{raw}");
        }
        for raw in [
            "DELETE_FAILED",
            "CREATE_FAILED",
            "ROLLBACK_IN_PROGRESS",
            "ROLLBACK_FAILED",
            "ROLLBACK_COMPLETE",
            "UPDATE_ROLLBACK_IN_PROGRESS",
            "UPDATE_ROLLBACK_FAILED",
            "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS",
            "UPDATE_ROLLBACK_COMPLETE",
            "OUT_OF_ORDER_EVENT",
        ] {
            assert_eq!(StackStatus::parse(raw).bucket(), StatusBucket::Failed, "{raw}");
        }
    }

    #[test]
    fn test_unknown_statuses() {
        assert_eq!(StackStatus::parse("IMPORT_ROLLBACK_FAILED").bucket(), StatusBucket::Failed);
        assert_eq!(StackStatus::parse("IMPORT_COMPLETE").bucket(), StatusBucket::Complete);
        assert_eq!(StackStatus::parse("REVIEW_IN_PROGRESS").bucket(), StatusBucket::InProgress);
        assert_eq!(StackStatus::parse("IMPORT_COMPLETE").as_str(), "IMPORT_COMPLETE");
    }

    #[test]
    fn test_round_trip_spelling() {
        let status = StackStatus::parse("UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS");
        assert_eq!(status, StackStatus::UpdateRollbackCompleteCleanupInProgress);
        assert_eq!(status.to_string(), "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS");
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS\"");
    }

    #[test]
    fn test_rollback_in_progress_is_failed_but_unsettled() {
        let status = StackStatus::RollbackInProgress;
        assert_eq!(status.bucket(), StatusBucket::Failed);
        assert!(!status.is_settled());
        assert!(StackStatus::RollbackComplete.is_settled());
    }

    #[test]
    fn test_delete_after_success_is_reported() {
        let mut tracker = LaunchTracker::new();
        tracker.observe(StackStatus::CreateInProgress);
        assert_eq!(tracker.observe(StackStatus::CreateComplete).0, StackStatus::CreateComplete);
        assert_eq!(tracker.observe(StackStatus::DeleteComplete).0, StackStatus::DeleteComplete);
    }

    #[test]
    fn test_delete_after_failure_is_out_of_order() {
        let mut tracker = LaunchTracker::new();
        tracker.observe(StackStatus::CreateFailed);
        let (status, reason) = tracker.observe(StackStatus::DeleteComplete);
        assert_eq!(status, StackStatus::OutOfOrderEvent);
        assert_eq!(reason, Some(OUT_OF_ORDER_REASON));
        assert!(!tracker.launch_succeeded());
    }

    #[test]
    fn test_failure_resets_launch() {
        let mut tracker = LaunchTracker::new();
        tracker.observe(StackStatus::CreateComplete);
        tracker.observe(StackStatus::UpdateRollbackFailed);
        assert!(!tracker.launch_succeeded());
    }
}
