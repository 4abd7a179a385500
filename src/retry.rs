//! Exponential backoff with jitter.
//!
//! Used for the agent's startup fetch and for re-establishing the policy
//! source watch. Per-object apply calls are deliberately not retried: the
//! next full cycle supersedes them.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff settings for an operation that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Multiplier applied after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Whether `attempt` (1-based) is the last one allowed
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Stateful delay sequence: grows by the multiplier, capped, with 0.5x-1.5x jitter
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    delay: Duration,
}

impl Backoff {
    /// Start a new sequence
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            delay: config.initial_delay,
        }
    }

    /// Next jittered delay; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);
        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        jittered
    }

    /// Return to the initial delay after a success
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
    }
}

/// Execute an async operation until it succeeds or attempts run out.
///
/// Errors that `should_retry` rejects are returned at once. Otherwise the
/// last error is returned once `max_attempts` is reached.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "operation failed with non-retryable error"
                );
                return Err(e);
            }
            Err(e) if config.exhausted(attempt) => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
