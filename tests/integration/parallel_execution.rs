//! Integration tests for dependency-aware parallel execution.
//!
//! These tests drive the public scheduler API end to end and check the
//! ordering, concurrency, and failure propagation guarantees on real tokio
//! tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cde_orchestrator::parallel::{SchedulerConfig, Task, TaskScheduler, TaskStatus};
use serde_json::json;

/// Tracks how many tasks are inside their work at once.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn gauged_task(id: &str, gauge: &Arc<Gauge>, millis: u64) -> Task {
    let gauge = Arc::clone(gauge);
    let label = id.to_string();
    Task::new(id, move || async move {
        gauge.enter();
        tokio::time::sleep(Duration::from_millis(millis)).await;
        gauge.exit();
        Ok::<_, std::io::Error>(json!(label))
    })
}

fn failing_task(id: &str) -> Task {
    let message = format!("{id} failed");
    Task::new(id, move || async move {
        Err::<serde_json::Value, _>(std::io::Error::new(std::io::ErrorKind::Other, message))
    })
}

/// Ten independent tasks with a pool of three never run more than three at once.
#[tokio::test]
async fn test_concurrency_bound_holds_under_burst() {
    let gauge = Arc::new(Gauge::default());
    let mut scheduler = TaskScheduler::new(SchedulerConfig::new(3));
    for i in 0..10 {
        scheduler
            .add_task(gauged_task(&format!("task-{i}"), &gauge, 20))
            .expect("add task");
    }

    let results = scheduler.execute().await.expect("execute");

    assert_eq!(results.len(), 10);
    assert!(results.values().all(|r| r.status == TaskStatus::Completed));
    assert!(gauge.peak() <= 3, "peak concurrency was {}", gauge.peak());
    assert!(gauge.peak() >= 2, "tasks never overlapped");
}

/// A dependent task never starts before its dependency has finished.
#[tokio::test]
async fn test_dependency_ordering_in_diamond() {
    let gauge = Arc::new(Gauge::default());
    let mut scheduler = TaskScheduler::new(SchedulerConfig::new(4));
    scheduler.add_task(gauged_task("define", &gauge, 10)).expect("add");
    scheduler
        .add_task(gauged_task("backend", &gauge, 15).depends_on(["define"]))
        .expect("add");
    scheduler
        .add_task(gauged_task("frontend", &gauge, 5).depends_on(["define"]))
        .expect("add");
    scheduler
        .add_task(gauged_task("review", &gauge, 1).depends_on(["backend", "frontend"]))
        .expect("add");

    let results = scheduler.execute().await.expect("execute");

    let started = |id: &str| results[id].started_at.expect("started");
    let finished = |id: &str| results[id].finished_at.expect("finished");
    assert!(started("backend") >= finished("define"));
    assert!(started("frontend") >= finished("define"));
    assert!(started("review") >= finished("backend"));
    assert!(started("review") >= finished("frontend"));
}

/// Failure skips every transitive dependent while independent branches run.
#[tokio::test]
async fn test_failure_propagates_only_to_dependents() {
    let gauge = Arc::new(Gauge::default());
    let mut scheduler = TaskScheduler::new(SchedulerConfig::new(2));
    scheduler.add_task(failing_task("schema")).expect("add");
    scheduler
        .add_task(gauged_task("api", &gauge, 1).depends_on(["schema"]))
        .expect("add");
    scheduler
        .add_task(gauged_task("client", &gauge, 1).depends_on(["api"]))
        .expect("add");
    scheduler.add_task(gauged_task("docs", &gauge, 1)).expect("add");

    let results = scheduler.execute().await.expect("execute");

    let statuses: HashMap<&str, TaskStatus> = results
        .iter()
        .map(|(id, result)| (id.as_str(), result.status))
        .collect();
    assert_eq!(statuses["schema"], TaskStatus::Failed);
    assert_eq!(statuses["api"], TaskStatus::Skipped);
    assert_eq!(statuses["client"], TaskStatus::Skipped);
    assert_eq!(statuses["docs"], TaskStatus::Completed);
    assert!(results["client"].started_at.is_none());
    assert_eq!(
        results["schema"].error.as_deref(),
        Some("schema failed")
    );
}

/// Every submitted task ends with a terminal result.
#[tokio::test]
async fn test_no_task_left_pending() {
    let gauge = Arc::new(Gauge::default());
    let mut scheduler = TaskScheduler::new(SchedulerConfig::new(2));
    scheduler.add_task(gauged_task("a", &gauge, 1)).expect("add");
    scheduler.add_task(failing_task("b").depends_on(["a"])).expect("add");
    scheduler
        .add_task(gauged_task("c", &gauge, 1).depends_on(["b"]))
        .expect("add");
    scheduler
        .add_task(Task::blocking("d", || Ok::<_, std::io::Error>(json!(4))).depends_on(["a"]))
        .expect("add");

    let results = scheduler.execute().await.expect("execute");

    assert_eq!(results.len(), 4);
    assert!(results.values().all(|r| r.status.is_terminal()));
    assert!(scheduler.graph().is_complete());

    let summary = scheduler.get_summary();
    assert_eq!(summary.total, 4);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
}

/// A missing dependency is reported before anything runs.
#[tokio::test]
async fn test_missing_dependency_rejected_before_execution() {
    let gauge = Arc::new(Gauge::default());
    let mut scheduler = TaskScheduler::new(SchedulerConfig::default());
    scheduler
        .add_task(gauged_task("deploy", &gauge, 1).depends_on(["build"]))
        .expect("add");

    let err = scheduler.execute().await.unwrap_err();

    assert!(err.to_string().contains("build"));
    assert_eq!(gauge.peak(), 0);
}

/// Cancelling mid-run lets the running task finish and skips the tasks that
/// never started.
#[tokio::test]
async fn test_cancel_mid_run_drains_running_and_skips_rest() {
    let gauge = Arc::new(Gauge::default());
    let mut scheduler = TaskScheduler::new(SchedulerConfig::new(1));
    scheduler.add_task(gauged_task("slow", &gauge, 200)).expect("add");
    scheduler.add_task(gauged_task("second", &gauge, 1)).expect("add");
    scheduler.add_task(gauged_task("third", &gauge, 1)).expect("add");

    let handle = scheduler.cancel_handle();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let results = scheduler.execute().await.expect("execute");
    canceller.await.expect("canceller");

    assert_eq!(results.len(), 3);
    assert_eq!(results["slow"].status, TaskStatus::Completed);
    assert_eq!(results["slow"].output, Some(json!("slow")));
    for id in ["second", "third"] {
        assert_eq!(results[id].status, TaskStatus::Skipped);
        assert_eq!(results[id].error.as_deref(), Some("run cancelled"));
        assert!(results[id].started_at.is_none());
    }
    assert!(scheduler.cancel_handle().is_cancelled());
}
