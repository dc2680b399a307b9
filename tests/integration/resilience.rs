//! Integration tests for the circuit breaker, retry policy, and guarded
//! delegation working together.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cde_orchestrator::delegate::{delegate_task, Delegate, DelegateError, GuardedDelegate};
use cde_orchestrator::error::ErrorCategory;
use cde_orchestrator::parallel::{SchedulerConfig, TaskScheduler, TaskStatus};
use cde_orchestrator::resilience::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    RetryPolicy,
};
use serde_json::{json, Value};

/// An agent that is down until `recover` is called.
struct OutageAgent {
    healthy: std::sync::atomic::AtomicBool,
    calls: AtomicU32,
}

impl OutageAgent {
    fn down() -> Self {
        Self {
            healthy: std::sync::atomic::AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    fn recover(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Delegate for OutageAgent {
    async fn delegate(&self, task: &str, _context: &Value) -> Result<Value, DelegateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(json!({"done": task}))
        } else {
            Err(DelegateError::transient("connection refused"))
        }
    }
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy::new(2).with_wait(Duration::from_millis(1), Duration::from_millis(2))
}

/// Threshold 2, timeout 100ms: two failures open the breaker, the third call
/// is rejected without reaching the agent, and a success after the timeout
/// closes it again.
#[tokio::test]
async fn test_breaker_recovers_after_outage() {
    let agent = Arc::new(OutageAgent::down());
    let breaker = Arc::new(CircuitBreaker::new(
        "agent",
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_timeout(Duration::from_millis(100)),
    ));
    let guarded = GuardedDelegate::new(Arc::clone(&agent), Arc::clone(&breaker))
        .with_retry(RetryPolicy::disabled());

    for _ in 0..2 {
        let err = guarded.delegate("plan", &Value::Null).await.unwrap_err();
        assert!(matches!(err, CallError::Failed(_)));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = guarded.delegate("plan", &Value::Null).await.unwrap_err();
    assert!(rejected.is_rejected());
    assert!(rejected.to_string().contains("is OPEN"));
    assert_eq!(agent.calls(), 2);

    tokio::time::sleep(Duration::from_millis(150)).await;
    agent.recover();

    let output = guarded.delegate("plan", &Value::Null).await.expect("recovered");
    assert_eq!(output["done"], "plan");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.get_stats().failure_count, 0);
}

/// Breakers handed out by a registry are shared by name, so an outage seen
/// by one delegate protects every other user of the same collaborator.
#[tokio::test]
async fn test_registry_shares_breaker_state() {
    let registry = CircuitBreakerRegistry::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_timeout(Duration::from_secs(60)),
    );
    let agent = Arc::new(OutageAgent::down());

    let first = GuardedDelegate::new(Arc::clone(&agent), registry.get_or_create("reviewer"))
        .with_retry(quick_retry());
    let second = GuardedDelegate::new(Arc::clone(&agent), registry.get_or_create("reviewer"))
        .with_retry(quick_retry());

    assert!(!first.delegate("review", &Value::Null).await.unwrap_err().is_rejected());
    assert!(second.delegate("review", &Value::Null).await.unwrap_err().is_rejected());
    assert_eq!(agent.calls(), 2);

    let stats = registry.all_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].state, CircuitState::Open);
}

/// Delegated tasks that hit an open breaker fail, and their dependents are
/// skipped instead of waiting on the outage.
#[tokio::test]
async fn test_open_breaker_fails_scheduled_delegation() {
    let agent = Arc::new(OutageAgent::down());
    let breaker = Arc::new(CircuitBreaker::new(
        "builder",
        CircuitBreakerConfig::new().with_failure_threshold(1),
    ));
    let guarded = Arc::new(
        GuardedDelegate::new(Arc::clone(&agent), breaker).with_retry(quick_retry()),
    );

    let mut scheduler = TaskScheduler::new(SchedulerConfig::new(1));
    scheduler
        .add_task(delegate_task("build", Arc::clone(&guarded), "build", json!({})))
        .expect("add");
    scheduler
        .add_task(delegate_task("test", guarded, "test", json!({})).depends_on(["build"]))
        .expect("add");

    let results = scheduler.execute().await.expect("execute");

    assert_eq!(results["build"].status, TaskStatus::Failed);
    assert_eq!(results["test"].status, TaskStatus::Skipped);
    assert_eq!(agent.calls(), 2);
}

/// The blocking retry path gives up on permanent failures immediately.
#[test]
fn test_blocking_retry_respects_categories() {
    let attempts = AtomicU32::new(0);
    let result: Result<(), DelegateError> = RetryPolicy::fs().run_blocking(|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(DelegateError::new(ErrorCategory::Permanent, "schema mismatch"))
    });

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
