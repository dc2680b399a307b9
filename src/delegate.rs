//! Boundary to external agents.
//!
//! A [`Delegate`] hands a task description to some outside collaborator and
//! returns its result. [`GuardedDelegate`] wraps one in a retry policy and a
//! circuit breaker so callers only ever see an exhausted retry, a rejected
//! call, or a timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::error::{Classify, ErrorCategory};
use crate::parallel::Task;
use crate::resilience::{CallError, CircuitBreaker, RetryPolicy};

/// Failure reported by a delegate, tagged with its category so transient
/// failures can be told apart from permanent ones.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{category} failure: {message}")]
pub struct DelegateError {
    pub category: ErrorCategory,
    pub message: String,
}

impl DelegateError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// The collaborator could not be reached. Worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, message)
    }

    /// The collaborator refused the request. Retrying will not help.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permanent, message)
    }

    pub fn is_transient(&self) -> bool {
        self.category.is_transient()
    }
}

impl Classify for DelegateError {
    fn category(&self) -> ErrorCategory {
        self.category
    }
}

/// Something that can run a described piece of work elsewhere.
#[async_trait]
pub trait Delegate: Send + Sync {
    async fn delegate(&self, task: &str, context: &Value) -> Result<Value, DelegateError>;
}

#[async_trait]
impl<D: Delegate + ?Sized> Delegate for Arc<D> {
    async fn delegate(&self, task: &str, context: &Value) -> Result<Value, DelegateError> {
        (**self).delegate(task, context).await
    }
}

/// A [`Delegate`] behind retry and a circuit breaker.
///
/// Retries happen inside one breaker call, so the breaker only counts a
/// failure once the retry policy has given up.
pub struct GuardedDelegate<D> {
    inner: D,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    operation_timeout: Option<Duration>,
}

impl<D: Delegate> GuardedDelegate<D> {
    /// Guards `inner` with `breaker` and the [`RetryPolicy::api`] preset.
    pub fn new(inner: D, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            inner,
            breaker,
            retry: RetryPolicy::api(),
            operation_timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Limits each breaker call, retries included.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn delegate(
        &self,
        task: &str,
        context: &Value,
    ) -> Result<Value, CallError<DelegateError>> {
        debug!(breaker = %self.breaker.name(), task, "delegating");
        let attempts = || self.retry.run(|| self.inner.delegate(task, context));
        match self.operation_timeout {
            Some(limit) => self.breaker.call_with_timeout(limit, attempts).await,
            None => self.breaker.call(attempts).await,
        }
    }
}

/// Builds a scheduler task that sends `description` through `delegate`.
pub fn delegate_task<D>(
    id: impl Into<String>,
    delegate: Arc<GuardedDelegate<D>>,
    description: impl Into<String>,
    context: Value,
) -> Task
where
    D: Delegate + 'static,
{
    let description = description.into();
    Task::new(id, move || async move {
        delegate.delegate(&description, &context).await
    })
}
