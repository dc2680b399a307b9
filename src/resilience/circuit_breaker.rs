//! Circuit breaker for calls to unreliable collaborators.
//!
//! A breaker starts `Closed`. Once `failure_threshold` consecutive expected
//! failures have been observed it turns `Open` and rejects calls without
//! running them. After `timeout` has elapsed since the last failure, calls are
//! admitted again as `HalfOpen` probes, at most `half_open_max_calls` at a
//! time. A successful probe closes the breaker; a failed one re-opens it.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`; admission (including the half-open slot check-and-increment)
//! happens in a single critical section.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{error_category_label, Classify, ErrorCategory};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Raised instead of running the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// The breaker is open and the recovery timeout has not elapsed.
    #[error("Circuit breaker '{name}' is OPEN. Service unavailable. Retry after {:.1}s.", .retry_after.as_secs_f64())]
    Open { name: String, retry_after: Duration },

    /// The breaker is half-open and every probe slot is taken.
    #[error("Circuit breaker '{name}' is HALF_OPEN. Max concurrent calls ({max_calls}) reached.")]
    HalfOpenCapacity { name: String, max_calls: u32 },
}

impl CircuitBreakerError {
    /// Name of the breaker that rejected the call.
    pub fn breaker_name(&self) -> &str {
        match self {
            CircuitBreakerError::Open { name, .. } => name,
            CircuitBreakerError::HalfOpenCapacity { name, .. } => name,
        }
    }
}

/// Outcome of a breaker-guarded call that did not succeed.
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// The breaker refused to run the operation.
    #[error(transparent)]
    Rejected(#[from] CircuitBreakerError),

    /// The operation ran and failed.
    #[error("{0}")]
    Failed(E),

    /// The operation exceeded its own time limit.
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
}

impl<E> CallError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }

    /// The operation's own error, if it ran and failed.
    pub fn into_failed(self) -> Option<E> {
        match self {
            CallError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Configuration for a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive expected failures that open the breaker.
    /// Default: 5
    pub failure_threshold: u32,

    /// Time spent open before a probe is allowed.
    /// Default: 60 seconds
    pub timeout: Duration,

    /// Concurrent probes admitted while half-open.
    /// Default: 1
    pub half_open_max_calls: u32,

    /// Failure categories that count toward the threshold.
    /// Default: everything except [`ErrorCategory::Internal`]
    pub expected: Vec<ErrorCategory>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            expected: ErrorCategory::ALL
                .into_iter()
                .filter(|category| *category != ErrorCategory::Internal)
                .collect(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.half_open_max_calls = max_calls;
        self
    }

    /// Replaces the set of categories that count as breaker failures.
    pub fn with_expected(mut self, categories: impl IntoIterator<Item = ErrorCategory>) -> Self {
        self.expected = categories.into_iter().collect();
        self
    }

    fn counts(&self, category: ErrorCategory) -> bool {
        self.expected.contains(&category)
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub rejected_count: u64,
    pub failure_threshold: u32,
    pub timeout_secs: f64,
    pub half_open_max_calls: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    rejected_count: u64,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    /// Bumped every time the breaker enters `HalfOpen`, so a probe slot
    /// from an earlier half-open period is never released twice.
    half_open_epoch: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            rejected_count: 0,
            last_failure: None,
            last_failure_at: None,
            half_open_in_flight: 0,
            half_open_epoch: 0,
        }
    }
}

/// Releases a half-open probe slot when dropped, including when the
/// caller's future is cancelled mid-call.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        let mut inner = self.breaker.lock();
        if inner.state == CircuitState::HalfOpen && inner.half_open_epoch == self.epoch {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// A named circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Does not perform the open-to-half-open transition;
    /// that only happens when a call is admitted.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn get_stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            rejected_count: inner.rejected_count,
            failure_threshold: self.config.failure_threshold,
            timeout_secs: self.config.timeout.as_secs_f64(),
            half_open_max_calls: self.config.half_open_max_calls,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Forces the breaker back to `Closed` with cleared counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let rejected_count = inner.rejected_count;
        *inner = BreakerInner::new();
        inner.rejected_count = rejected_count;
        info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Runs `operation` through the breaker.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let _slot = self.admit()?;
        let result = operation().await;
        self.settle(result.as_ref().map(|_| ()).map_err(Classify::category));
        result.map_err(CallError::Failed)
    }

    /// Runs `operation` through the breaker with a time limit. Expiry counts
    /// as an expected failure regardless of the configured categories.
    pub async fn call_with_timeout<T, E, F, Fut>(
        &self,
        limit: Duration,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let _slot = self.admit()?;
        match tokio::time::timeout(limit, operation()).await {
            Ok(result) => {
                self.settle(result.as_ref().map(|_| ()).map_err(Classify::category));
                result.map_err(CallError::Failed)
            }
            Err(_) => {
                warn!(
                    breaker = %self.name,
                    limit_ms = limit.as_millis() as u64,
                    "guarded operation timed out"
                );
                self.record_failure();
                Err(CallError::TimedOut(limit))
            }
        }
    }

    /// Runs a synchronous `operation` through the breaker.
    pub fn call_blocking<T, E, F>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: Classify,
    {
        let _slot = self.admit()?;
        let result = operation();
        self.settle(result.as_ref().map(|_| ()).map_err(Classify::category));
        result.map_err(CallError::Failed)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides whether a call may run. Returns a probe slot when the call
    /// is admitted as a half-open probe.
    fn admit(&self) -> Result<Option<ProbeSlot<'_>>, CircuitBreakerError> {
        let mut inner = self.lock();
        let max_calls = self.config.half_open_max_calls.max(1);

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(self.config.timeout);
            if elapsed < self.config.timeout {
                inner.rejected_count += 1;
                debug!(breaker = %self.name, "call rejected, breaker is open");
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after: self.config.timeout - elapsed,
                });
            }
            inner.state = CircuitState::HalfOpen;
            inner.half_open_in_flight = 0;
            inner.half_open_epoch += 1;
            info!(breaker = %self.name, "circuit breaker entering half-open state");
        }

        let state = inner.state;
        match state {
            CircuitState::HalfOpen if inner.half_open_in_flight >= max_calls => {
                inner.rejected_count += 1;
                debug!(breaker = %self.name, "call rejected, half-open probes exhausted");
                Err(CircuitBreakerError::HalfOpenCapacity {
                    name: self.name.clone(),
                    max_calls,
                })
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight += 1;
                Ok(Some(ProbeSlot {
                    breaker: self,
                    epoch: inner.half_open_epoch,
                }))
            }
            _ => Ok(None),
        }
    }

    fn settle(&self, outcome: Result<(), ErrorCategory>) {
        match outcome {
            Ok(()) => self.record_success(),
            Err(category) if self.config.counts(category) => self.record_failure(),
            Err(category) => debug!(
                breaker = %self.name,
                category = error_category_label(&category),
                "failure outside expected set, breaker state unchanged"
            ),
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.half_open_in_flight = 0;
            info!(breaker = %self.name, "circuit breaker closed, service recovered");
        } else {
            inner.failure_count = 0;
            inner.success_count += 1;
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_in_flight = 0;
                error!(breaker = %self.name, "half-open probe failed, circuit breaker re-opened");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                error!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "circuit breaker opened"
                );
            }
            _ => warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                threshold = self.config.failure_threshold,
                "circuit breaker recorded failure"
            ),
        }
    }
}

/// Wraps an async function so every invocation runs through `breaker`.
pub fn guarded<A, T, E, F, Fut>(
    breaker: Arc<CircuitBreaker>,
    f: F,
) -> impl Fn(A) -> BoxFuture<'static, Result<T, CallError<E>>> + Send + Sync + Clone
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    A: Send + 'static,
    T: Send + 'static,
    E: Classify + Send + 'static,
{
    let f = Arc::new(f);
    move |arg: A| {
        let breaker = Arc::clone(&breaker);
        let f = Arc::clone(&f);
        Box::pin(async move { breaker.call(move || f(arg)).await })
    }
}
