//! Bounded exponential backoff for calls to external collaborators.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapters::ProviderError;

/// Retry policy for transient collaborator failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Per-call limits: one attempt may not exceed `attempt_timeout`, and all
/// attempts together (including backoff sleeps) may not exceed `budget`
#[derive(Debug, Clone, Copy)]
pub struct CallLimits {
    pub attempt_timeout: Duration,
    pub budget: Duration,
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts or
/// exhausts the wall-clock budget.
///
/// Each attempt receives its own timeout, already clipped to the remaining
/// budget. Only transient errors are retried. An attempt cut off by the
/// timeout is dropped, which kills any child process spawned with
/// `kill_on_drop`.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    limits: CallLimits,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let remaining = limits.budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(ProviderError::transient(
                label,
                format!("wall-clock budget of {:?} exhausted", limits.budget),
            ));
        }
        let attempt_timeout = limits.attempt_timeout.min(remaining);

        let result = match tokio::time::timeout(attempt_timeout, op(attempt_timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::transient(
                label,
                format!("timed out after {:?}", attempt_timeout),
            )),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                if started.elapsed() + delay >= limits.budget {
                    return Err(e);
                }

                warn!(
                    call = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Call failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
