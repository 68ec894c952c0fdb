//! Fixed-interval retry for transient file I/O.
//!
//! Another process may hold the cache file mid-update. Such failures are
//! retried at a constant interval; once the budget is spent the operation
//! fails with [`Error::Timeout`] instead of hanging.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use keyiv_common::{Error, Result};

/// Default wait between attempts (200 ms).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Default number of attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set delay between attempts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Upper bound on how long a full retry cycle may take.
    pub fn budget(&self) -> Duration {
        self.delay * self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

/// Retry executor for running operations with retry logic.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an operation, retrying transient failures.
    ///
    /// `what` names the operation in logs and in the timeout message.
    ///
    /// # Errors
    /// - Non-transient errors are returned immediately
    /// - `Timeout` once `max_attempts` transient failures occurred
    pub async fn execute<F, Fut, T>(&self, what: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("{} succeeded after {} attempts", what, attempt);
                    }
                    return Ok(result);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    if attempt >= self.config.max_attempts {
                        warn!("{} failed after {} attempts: {}", what, attempt, err);
                        return Err(Error::Timeout(format!(
                            "Failed to {} after {} attempts: {}",
                            what, attempt, err
                        )));
                    }

                    warn!(
                        "Attempt {} to {} failed: {}. Retrying in {:?}...",
                        attempt, what, err, self.config.delay
                    );
                    sleep(self.config.delay).await;
                }
            }
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}
