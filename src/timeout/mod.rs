//! Timeout configuration.
//!
//! Two limits apply during orchestration: one for each guarded call to an
//! external collaborator, and one for a whole scheduling run. Both are
//! independent of the circuit breaker's own open-state timeout.

use std::time::Duration;

/// Configuration for time limits during orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum time allowed for one delegated operation.
    /// Expiry counts as a breaker failure.
    /// Default: 600 seconds (10 minutes)
    pub operation_timeout: Duration,

    /// Maximum time allowed for an entire scheduling run.
    /// When exceeded, running tasks are aborted and the rest are skipped.
    /// Default: 1800 seconds (30 minutes)
    pub run_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(600),
            run_timeout: Duration::from_secs(1800),
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a TimeoutConfig with custom values.
    pub fn with_values(operation_timeout: Duration, run_timeout: Duration) -> Self {
        Self {
            operation_timeout,
            run_timeout,
        }
    }

    /// Sets the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets the run timeout.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }
}
