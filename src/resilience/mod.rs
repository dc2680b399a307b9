//! Resilience primitives for calls to external collaborators.
//!
//! [`RetryPolicy`] repeats an operation on transient failures with capped
//! exponential backoff. [`CircuitBreaker`] stops calling a collaborator that
//! keeps failing. Retries run inside one breaker-guarded call, so the breaker
//! only sees a failure once the retry budget is spent.

pub mod circuit_breaker;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    guarded, BreakerStats, CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitState,
};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryDecision, RetryPolicy};
