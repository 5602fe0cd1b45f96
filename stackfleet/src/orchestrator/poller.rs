//! Status polling workers.
//!
//! One worker runs per credential profile and region. Each worker owns the
//! ids of the stacks it still has to watch, re-describes them every
//! [`FleetOptions::poll_interval`] and reports what it saw over a channel.
//! The single receiver is the fleet, which is the only place stack state is
//! mutated.

use crate::cloud::{StackApi, StackDescription};
use crate::errors::CloudError;
use crate::stack::StackStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffered status messages before workers wait on the fleet.
pub const POLL_CHANNEL_CAPACITY: usize = 256;

/// Polling knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetOptions {
    /// Pause between two polling rounds.
    pub poll_interval: Duration,
    /// Give up on stacks still running after this long. `None` polls forever.
    pub stack_timeout: Option<Duration>,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            stack_timeout: None,
        }
    }
}

impl FleetOptions {
    /// Creates the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the overall timeout.
    #[must_use]
    pub fn with_stack_timeout(mut self, timeout: Duration) -> Self {
        self.stack_timeout = Some(timeout);
        self
    }
}

/// What a worker observed for one stack.
#[derive(Debug, Clone)]
pub enum PollMessage {
    /// A fresh description.
    Status {
        /// Stack id.
        stack_id: String,
        /// Description as returned by the provider.
        description: StackDescription,
    },
    /// The stack could not be described and is no longer watched.
    Failed {
        /// Stack id.
        stack_id: String,
        /// The non-retryable error.
        error: CloudError,
    },
}

/// Spawns a worker watching `stack_ids` through `api`.
pub(crate) fn spawn_worker(
    api: Arc<dyn StackApi>,
    stack_ids: Vec<String>,
    interval: Duration,
    tx: mpsc::Sender<PollMessage>,
) -> JoinHandle<()> {
    tokio::spawn(poll_until_settled(api, stack_ids, interval, tx))
}

async fn poll_until_settled(
    api: Arc<dyn StackApi>,
    mut pending: Vec<String>,
    interval: Duration,
    tx: mpsc::Sender<PollMessage>,
) {
    while !pending.is_empty() {
        tokio::time::sleep(interval).await;

        let mut unsettled = Vec::with_capacity(pending.len());
        for stack_id in pending {
            let message = match describe(api.as_ref(), &stack_id).await {
                Ok(description) => {
                    if !StackStatus::parse(&description.status).is_settled() {
                        unsettled.push(stack_id.clone());
                    }
                    PollMessage::Status { stack_id, description }
                }
                Err(error) if error.is_retryable() => {
                    warn!(stack_id = %stack_id, error = %error, "Status poll failed, retrying next round");
                    unsettled.push(stack_id);
                    continue;
                }
                Err(error) => PollMessage::Failed { stack_id, error },
            };
            if tx.send(message).await.is_err() {
                debug!("Fleet stopped listening, worker exiting");
                return;
            }
        }
        pending = unsettled;
    }
}

async fn describe(api: &dyn StackApi, stack_id: &str) -> Result<StackDescription, CloudError> {
    api.describe_stacks(Some(stack_id), None)
        .await?
        .items
        .into_iter()
        .next()
        .ok_or_else(|| CloudError::not_found("describe-stacks", format!("stack {stack_id} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CreateStackRequest;
    use crate::testing::{InMemoryCloud, StackScript};

    fn request(name: &str) -> CreateStackRequest {
        CreateStackRequest {
            stack_name: name.to_string(),
            template_url: "https://b.s3.amazonaws.com/p/main.yaml".to_string(),
            parameters: Vec::new(),
            tags: Vec::new(),
            capabilities: Vec::new(),
            disable_rollback: true,
            role_arn: None,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<PollMessage>) -> Vec<PollMessage> {
        let mut out = Vec::new();
        while let Some(message) = rx.recv().await {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_options_builders() {
        let options = FleetOptions::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_stack_timeout(Duration::from_secs(60));
        assert_eq!(options.poll_interval, Duration::from_millis(10));
        assert_eq!(options.stack_timeout, Some(Duration::from_secs(60)));
        assert_eq!(FleetOptions::default().stack_timeout, None);
    }

    #[tokio::test]
    async fn test_worker_reports_until_settled() {
        let cloud = InMemoryCloud::new();
        cloud.script_stack("slow", StackScript::succeeds_after(2));
        let api = cloud.region_client("us-east-1");
        let id = api.create_stack(request("slow")).await.unwrap();

        let (tx, rx) = mpsc::channel(POLL_CHANNEL_CAPACITY);
        let handle = spawn_worker(api, vec![id.clone()], Duration::from_millis(1), tx);
        let messages = drain(rx).await;
        handle.await.unwrap();

        let statuses: Vec<String> = messages
            .iter()
            .map(|m| match m {
                PollMessage::Status { description, .. } => description.status.clone(),
                PollMessage::Failed { .. } => "error".to_string(),
            })
            .collect();
        assert_eq!(statuses, vec!["CREATE_IN_PROGRESS", "CREATE_IN_PROGRESS", "CREATE_COMPLETE"]);
    }

    #[tokio::test]
    async fn test_missing_stack_reported_once() {
        let cloud = InMemoryCloud::new();
        let (tx, rx) = mpsc::channel(POLL_CHANNEL_CAPACITY);
        spawn_worker(
            cloud.region_client("us-east-1"),
            vec!["arn:aws:cloudformation:us-east-1:123456789012:stack/gone/1".to_string()],
            Duration::from_millis(1),
            tx,
        );
        let messages = drain(rx).await;
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            PollMessage::Failed { error, .. } => assert!(error.is_not_found()),
            PollMessage::Status { .. } => panic!("expected a failure"),
        }
    }
}
