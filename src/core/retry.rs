//! Retry policy for transient failures.
//!
//! Used around acquisition, where failures are almost always network or
//! catalog hiccups. The delay is fixed; there is no exponential growth.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retry policy for a failing operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between attempts in seconds
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

fn default_max_retries() -> u32 {
    5
}
fn default_delay_secs() -> u64 {
    10
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_secs: default_delay_secs(),
        }
    }
}

/// Outcome of exhausting a retry policy
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// Attempts made
    pub attempts: u32,

    /// Error from the final attempt
    pub last_error: E,
}

impl RetryPolicy {
    /// Policy with no delay (tests, or interactive use)
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay_secs: 0,
        }
    }

    /// Total attempts the policy allows
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the next attempt
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    /// Check if we should retry based on attempt count (1-indexed)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Run `op` until it succeeds or the policy is exhausted.
    ///
    /// `op` receives the 1-indexed attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !self.should_retry(attempt) {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }

                    warn!(
                        operation = label,
                        attempt,
                        delay_secs = self.delay_secs,
                        error = %e,
                        "Attempt failed, retrying"
                    );

                    if self.delay_secs > 0 {
                        tokio::time::sleep(self.delay()).await;
                    }
                }
            }
        }
    }
}
