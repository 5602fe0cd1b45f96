//! Logging setup and run progress reporting.

mod progress;

pub use progress::{CollectingProgressSink, LoggingProgressSink, NoOpProgressSink, ProgressEvent, ProgressSink};

use crate::errors::FleetError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable, multi-line.
    Pretty,
    /// Single-line human readable.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Builds the filter from `RUST_LOG`, defaulting to `info`.
#[must_use]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global tracing subscriber.
///
/// Call once from a binary. Fails if a subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<(), FleetError> {
    let registry = tracing_subscriber::registry().with(env_filter());
    let result = match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    result.map_err(|e| FleetError::Internal(format!("failed to install tracing subscriber: {e}")))?;
    tracing::debug!(?format, "Tracing initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // the first call may lose to another test
        let _ = init_tracing(LogFormat::Json);
        assert!(init_tracing(LogFormat::Compact).is_err());
    }
}
