//! Retry utilities with configurable backoff and jitter strategies.
//!
//! Cloud calls retry locally on transient failures (throttling, session
//! bootstrap races). Authorization and malformed-input failures are never
//! retried; callers express that through the `is_retryable` predicate.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// How the wait grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Doubles per attempt.
    #[default]
    Exponential,
    /// Grows by one base step per attempt.
    Linear,
    /// Always the base delay.
    Constant,
}

/// Randomisation applied on top of the computed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JitterStrategy {
    /// Exact waits.
    None,
    /// Anywhere between zero and the wait.
    #[default]
    Full,
    /// At least half the wait.
    Equal,
}

/// Attempt budget and wait policy for one kind of cloud call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    pub max_attempts: usize,
    /// First wait, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single wait, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth of the wait.
    pub backoff_strategy: BackoffStrategy,
    /// Randomisation of the wait.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Three attempts, exponential from one second with full jitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload policy: 5 attempts, linear 2s steps, no jitter.
    #[must_use]
    pub fn uploads() -> Self {
        Self::new()
            .with_max_attempts(5)
            .with_base_delay_ms(2000)
            .with_max_delay_ms(10_000)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None)
    }

    /// Client/session creation policy: 4 attempts, exponential from 100ms.
    #[must_use]
    pub fn client_creation() -> Self {
        Self::new()
            .with_max_attempts(4)
            .with_base_delay_ms(100)
            .with_max_delay_ms(2000)
            .with_backoff(BackoffStrategy::Exponential)
            .with_jitter(JitterStrategy::Equal)
    }

    /// Sets the total attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first wait.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Caps every wait.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets how waits grow.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets how waits are randomised.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Calculates the delay to wait after the given failed attempt (0-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);

        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(attempt)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Error returned by [`with_retry_if`] carrying the attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    /// Attempts made before giving up.
    pub attempts: usize,
    /// The last error observed.
    pub error: E,
}

/// Executes an operation, retrying while `is_retryable` holds and attempts remain.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    key: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if attempt >= max_attempts || !is_retryable(&error) {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        error,
                    });
                }
                let delay = config.delay_for(attempt - 1);
                tracing::debug!(
                    key = %key,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Executes an operation with retry logic, retrying every error.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, key: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, key, operation, |_| true)
        .await
        .map_err(|exhausted| exhausted.error)
}
