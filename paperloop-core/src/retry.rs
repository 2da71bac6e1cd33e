//! Retry policies for the workflow's external calls.
//!
//! Two budgets exist: a network budget for paper fetches and a longer LLM
//! budget for model calls. Both back off exponentially. They wrap a step from
//! the outside, so a fetch nests this policy around the fetcher's own
//! rate-limit retry.

use crate::error::{FetchError, LlmError, WorkflowError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Bounded exponential-backoff retry budget for one class of step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    pub first_interval_ms: u64,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Multiplier applied to the delay after each retry.
    pub backoff_coefficient: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_interval_ms: u64,
    /// Wall-clock budget measured from the first attempt, in seconds.
    pub total_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::network()
    }
}

impl RetryPolicy {
    /// Budget for paper-index fetches: 5s first retry, 2 minutes total.
    pub fn network() -> Self {
        Self {
            first_interval_ms: 5_000,
            max_attempts: 3,
            backoff_coefficient: 2.0,
            max_interval_ms: 30_000,
            total_timeout_secs: 120,
        }
    }

    /// Budget for model calls: 2s first retry, 5 minutes total.
    pub fn llm() -> Self {
        Self {
            first_interval_ms: 2_000,
            max_attempts: 3,
            backoff_coefficient: 2.0,
            max_interval_ms: 30_000,
            total_timeout_secs: 300,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let base = self.first_interval_ms as f64 * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }
}

/// Errors that may clear up if the call is simply issued again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        FetchError::is_transient(self)
    }
}

impl Transient for LlmError {
    fn is_transient(&self) -> bool {
        LlmError::is_transient(self)
    }
}

/// The last error seen once a policy gives up.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub error: E,
}

impl<E: fmt::Display> RetryFailure<E> {
    pub fn into_step_error(self, step: &str) -> WorkflowError {
        WorkflowError::StepFailed {
            step: step.to_string(),
            attempts: self.attempts,
            message: self.error.to_string(),
        }
    }
}

/// Run `operation` under `policy`, retrying transient failures.
///
/// Stops at the attempt cap, at the first permanent error, or when the next
/// delay would overrun the total budget.
pub async fn with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    step: &str,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + fmt::Display,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !error.is_transient() || attempt >= max_attempts {
            return Err(RetryFailure {
                attempts: attempt,
                error,
            });
        }

        let delay = policy.delay_before_retry(attempt);
        if started.elapsed() + delay > policy.total_timeout() {
            tracing::warn!(
                step,
                attempt,
                budget_secs = policy.total_timeout_secs,
                error = %error,
                "Retry budget exhausted"
            );
            return Err(RetryFailure {
                attempts: attempt,
                error,
            });
        }

        tracing::warn!(
            step,
            attempt,
            max = max_attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after transient error"
        );
        tokio::time::sleep(delay).await;
    }
}
