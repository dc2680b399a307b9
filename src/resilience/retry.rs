//! Retry with capped exponential backoff.
//!
//! A [`RetryPolicy`] is a plain value. The same policy drives blocking
//! operations through [`RetryPolicy::run_blocking`] and async operations
//! through [`RetryPolicy::run`]; both share [`RetryPolicy::decide`], so the
//! backoff schedule and the retry/give-up rules are identical in either mode.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{error_category_label, Classify, ErrorCategory};

/// Categories retried by [`RetryPolicy::default`]: anything raised by the OS.
const OS_LEVEL: [ErrorCategory; 5] = [
    ErrorCategory::Io,
    ErrorCategory::PermissionDenied,
    ErrorCategory::Connection,
    ErrorCategory::Timeout,
    ErrorCategory::Locked,
];

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again.
    Retry(Duration),
    /// The failure was retryable but no attempts remain.
    Exhausted,
    /// The failure kind is not in the retry set.
    NotRetryable,
}

/// Retry settings for one class of operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of tries, including the first one.
    /// Default: 3
    pub max_attempts: u32,

    /// Scale of the exponential wait, in seconds.
    /// Default: 1.0
    pub multiplier: f64,

    /// Lower bound for any single wait.
    /// Default: 1 second
    pub wait_min: Duration,

    /// Upper bound for any single wait.
    /// Default: 10 seconds
    pub wait_max: Duration,

    /// Failure categories that trigger another attempt.
    pub retry_on: Vec<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 1.0,
            wait_min: Duration::from_secs(1),
            wait_max: Duration::from_secs(10),
            retry_on: OS_LEVEL.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default backoff and the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Local filesystem operations: quick retries with short waits.
    pub fn fs() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 0.5,
            wait_min: Duration::from_millis(500),
            wait_max: Duration::from_secs(2),
            retry_on: OS_LEVEL.to_vec(),
        }
    }

    /// Network operations: more attempts and a long backoff ceiling.
    pub fn network() -> Self {
        Self {
            max_attempts: 5,
            multiplier: 1.0,
            wait_min: Duration::from_secs(1),
            wait_max: Duration::from_secs(30),
            retry_on: vec![ErrorCategory::Connection, ErrorCategory::Timeout],
        }
    }

    /// External API calls: moderate attempts and backoff.
    pub fn api() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 1.0,
            wait_min: Duration::from_secs(1),
            wait_max: Duration::from_secs(10),
            retry_on: vec![ErrorCategory::Connection, ErrorCategory::Timeout],
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn disabled() -> Self {
        Self::new(1)
    }

    /// Sets the total number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the wait bounds.
    pub fn with_wait(mut self, wait_min: Duration, wait_max: Duration) -> Self {
        self.wait_min = wait_min;
        self.wait_max = wait_max;
        self
    }

    /// Replaces the set of retryable categories.
    pub fn with_retry_on(mut self, categories: impl IntoIterator<Item = ErrorCategory>) -> Self {
        self.retry_on = categories.into_iter().collect();
        self
    }

    /// Whether a failure of this category is retried.
    pub fn retries(&self, category: ErrorCategory) -> bool {
        self.retry_on.contains(&category)
    }

    /// Wait before the attempt that follows attempt number `attempt` (1-based).
    ///
    /// The wait is `multiplier * 2^(attempt - 1)` seconds, clamped to
    /// `[wait_min, wait_max]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let min = self.wait_min.as_secs_f64();
        let max = self.wait_max.as_secs_f64().max(min);
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let raw = self.multiplier * 2f64.powi(exponent);
        let secs = if raw.is_finite() {
            raw.clamp(min, max)
        } else {
            max
        };
        Duration::from_secs_f64(secs)
    }

    /// Decides what happens after attempt number `attempt` failed with `category`.
    pub fn decide(&self, attempt: u32, category: ErrorCategory) -> RetryDecision {
        if !self.retries(category) {
            RetryDecision::NotRetryable
        } else if attempt >= self.max_attempts.max(1) {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry(self.delay_for(attempt))
        }
    }

    /// Runs a blocking operation, sleeping the current thread between attempts.
    pub fn run_blocking<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Classify + Display,
    {
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(value) => {
                    self.log_success(attempt);
                    return Ok(value);
                }
                Err(err) => match self.on_failure(attempt, &err) {
                    RetryDecision::Retry(delay) => std::thread::sleep(delay),
                    _ => return Err(err),
                },
            }
            attempt += 1;
        }
    }

    /// Runs an async operation, yielding to the runtime between attempts.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    self.log_success(attempt);
                    return Ok(value);
                }
                Err(err) => match self.on_failure(attempt, &err) {
                    RetryDecision::Retry(delay) => tokio::time::sleep(delay).await,
                    _ => return Err(err),
                },
            }
            attempt += 1;
        }
    }

    /// Like [`RetryPolicy::run_blocking`], but returns `fallback` once a
    /// retryable failure has used up every attempt.
    pub fn run_blocking_or<T, E, F>(&self, fallback: T, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Classify + Display,
    {
        let result = self.run_blocking(operation);
        self.apply_fallback(result, fallback)
    }

    /// Like [`RetryPolicy::run`], but returns `fallback` once a retryable
    /// failure has used up every attempt.
    pub async fn run_or<T, E, F, Fut>(&self, fallback: T, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let result = self.run(operation).await;
        self.apply_fallback(result, fallback)
    }

    fn apply_fallback<T, E: Classify>(&self, result: Result<T, E>, fallback: T) -> Result<T, E> {
        match result {
            Err(err) if self.retries(err.category()) => {
                warn!(
                    category = error_category_label(&err.category()),
                    "returning fallback value after retries were exhausted"
                );
                Ok(fallback)
            }
            other => other,
        }
    }

    fn on_failure<E: Classify + Display>(&self, attempt: u32, err: &E) -> RetryDecision {
        let category = err.category();
        let decision = self.decide(attempt, category);
        match decision {
            RetryDecision::Retry(delay) => warn!(
                attempt,
                max_attempts = self.max_attempts,
                category = error_category_label(&category),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            ),
            RetryDecision::Exhausted => error!(
                attempts = attempt,
                category = error_category_label(&category),
                error = %err,
                "operation failed after all retry attempts"
            ),
            RetryDecision::NotRetryable => debug!(
                attempt,
                category = error_category_label(&category),
                error = %err,
                "failure is not retryable"
            ),
        }
        decision
    }

    fn log_success(&self, attempt: u32) {
        if attempt > 1 {
            debug!(attempt, "operation succeeded after retry");
        }
    }
}
