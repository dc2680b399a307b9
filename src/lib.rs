//! Orchestration core for agent-driven workflows.
//!
//! - [`parallel`]: dependency-aware task scheduling on a bounded pool.
//! - [`resilience`]: circuit breakers and retry policies around unreliable
//!   collaborators.
//! - [`state`]: a durable JSON state document with atomic writes and
//!   rotating backups.
//! - [`delegate`]: the guarded boundary to external agents.

pub mod config;
pub mod delegate;
pub mod error;
pub mod logging;
pub mod parallel;
pub mod resilience;
pub mod state;
pub mod timeout;

pub use config::{ConfigError, OrchestratorConfig};
pub use delegate::{delegate_task, Delegate, DelegateError, GuardedDelegate};
pub use error::{BoxError, Classify, ErrorCategory};
pub use parallel::{SchedulerConfig, SchedulerError, Task, TaskResult, TaskScheduler, TaskStatus};
pub use resilience::{
    guarded, CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerRegistry, CircuitState, RetryPolicy,
};
pub use state::{
    FeatureRecord, FeatureStatus, PersistentStateStore, Phase, StateDocument, StateError,
    StateStoreConfig,
};
pub use timeout::TimeoutConfig;
