//! Parallel task scheduler
//!
//! Runs the tasks of a [`DependencyGraph`] on the tokio runtime, at most
//! `max_concurrent` at a time. A single loop owns the graph: it hands out
//! ready tasks, spawns them with a semaphore permit, and records each result
//! as it arrives, so no task is dispatched twice and no result is counted
//! twice.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::dependency::{DependencyGraph, ReadyTask, RunSummary, SchedulerError};
use super::task::{Task, TaskResult, TaskStatus};
use crate::timeout::TimeoutConfig;

/// Called with `(task_id, status)` when a task starts and when it reaches a
/// terminal status.
pub type ProgressCallback = Arc<dyn Fn(&str, TaskStatus) + Send + Sync>;

const REASON_CANCELLED: &str = "run cancelled";
const REASON_STUCK: &str = "no runnable tasks remain; dependencies can never complete";
const REASON_LOST: &str = "task handle failed before reporting a result";

/// Configuration options for a scheduling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of tasks running at once.
    /// Default: 3
    pub max_concurrent: usize,
    /// Limit for the whole run. When it expires, running tasks are aborted
    /// and recorded as failed, and pending tasks are skipped.
    /// Default: none
    pub run_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            run_timeout: None,
        }
    }
}

impl SchedulerConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Self::default()
        }
    }

    /// Builds a config that takes its run limit from `timeouts`.
    pub fn from_timeouts(max_concurrent: usize, timeouts: &TimeoutConfig) -> Self {
        Self {
            max_concurrent,
            run_timeout: Some(timeouts.run_timeout),
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }
}

/// Requests cancellation of a scheduling run from outside the scheduler.
///
/// Cancelling stops dispatch. Tasks already running are allowed to finish,
/// and tasks that never started are recorded as skipped.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Dependency-aware task scheduler with bounded concurrency.
///
/// A scheduler runs once; create a new one for the next run.
pub struct TaskScheduler {
    config: SchedulerConfig,
    graph: DependencyGraph,
    semaphore: Arc<Semaphore>,
    cancel_tx: Arc<watch::Sender<bool>>,
    progress: Option<ProgressCallback>,
    executed: bool,
    elapsed: Option<Duration>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        Self {
            config,
            graph: DependencyGraph::new(),
            semaphore,
            cancel_tx: Arc::new(cancel_tx),
            progress: None,
            executed: false,
            elapsed: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Registers a task for the run.
    pub fn add_task(&mut self, task: Task) -> Result<(), SchedulerError> {
        if self.executed {
            return Err(SchedulerError::AlreadyExecuted);
        }
        self.graph.add_task(task)
    }

    /// Sets the callback notified on every status change.
    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str, TaskStatus) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Wall-clock time of the finished run.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn get_summary(&self) -> RunSummary {
        self.graph.summary()
    }

    /// Runs every task to a terminal status and returns one result per task.
    ///
    /// Missing dependencies and cycles are reported before anything runs.
    /// A failing task never stops independent tasks; its dependents are
    /// skipped.
    pub async fn execute(&mut self) -> Result<HashMap<String, TaskResult>, SchedulerError> {
        if self.executed {
            return Err(SchedulerError::AlreadyExecuted);
        }
        self.executed = true;
        self.graph.validate()?;

        let started = Instant::now();
        info!(
            tasks = self.graph.len(),
            max_concurrent = self.config.max_concurrent,
            "starting scheduling run"
        );

        let mut cancel_rx = self.cancel_tx.subscribe();
        let mut cancelled = *cancel_rx.borrow_and_update();
        let mut cancel_closed = false;
        if cancelled {
            self.skip_pending(REASON_CANCELLED);
        }

        let run_timeout = self.config.run_timeout;
        let deadline = async move {
            match run_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut in_flight: JoinSet<TaskResult> = JoinSet::new();

        loop {
            if !cancelled {
                self.dispatch(&mut in_flight);
            }

            if in_flight.is_empty() {
                if self.fail_lost_tasks() > 0 {
                    continue;
                }
                if !self.graph.is_complete() {
                    let stuck = self.graph.fail_pending(REASON_STUCK);
                    error!(tasks = ?stuck, "scheduling run cannot make progress");
                    self.notify_all(&stuck, TaskStatus::Failed);
                }
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok(result)) => self.record(result),
                    // The task stays running until the set drains; see fail_lost_tasks.
                    Some(Err(join_error)) => warn!(error = %join_error, "task handle failed"),
                    None => {}
                },
                changed = cancel_rx.changed(), if !cancelled && !cancel_closed => {
                    if changed.is_err() {
                        cancel_closed = true;
                    } else if *cancel_rx.borrow_and_update() {
                        cancelled = true;
                        info!(running = in_flight.len(), "cancellation requested, draining running tasks");
                        self.skip_pending(REASON_CANCELLED);
                    }
                }
                _ = &mut deadline => {
                    let limit = run_timeout.unwrap_or_default();
                    error!(limit_ms = limit.as_millis() as u64, "scheduling run timed out");
                    in_flight.abort_all();
                    while let Some(joined) = in_flight.join_next().await {
                        if let Ok(result) = joined {
                            self.record(result);
                        }
                    }
                    let reason = format!("run timed out after {:?}", limit);
                    let aborted = self.graph.fail_running(&reason);
                    self.notify_all(&aborted, TaskStatus::Failed);
                    self.skip_pending(&reason);
                    break;
                }
            }
        }

        let elapsed = started.elapsed();
        self.elapsed = Some(elapsed);
        let summary = self.graph.summary();
        info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            elapsed_ms = elapsed.as_millis() as u64,
            "scheduling run finished"
        );

        Ok(self.graph.results().clone())
    }

    /// Spawns ready tasks while worker slots are free.
    fn dispatch(&mut self, in_flight: &mut JoinSet<TaskResult>) {
        while let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            let Some(ReadyTask { id, metadata, work }) = self.graph.take_ready(1).pop() else {
                break;
            };

            debug!(task = %id, metadata = ?metadata, running = in_flight.len() + 1, "dispatching task");
            self.notify(&id, TaskStatus::Running);

            in_flight.spawn(async move {
                // Hold the permit until the task completes (RAII)
                let _permit = permit;
                let started_at = Utc::now();
                let clock = Instant::now();

                let outcome = AssertUnwindSafe(async move { work().await })
                    .catch_unwind()
                    .await;

                let duration = clock.elapsed();
                match outcome {
                    Ok(Ok(output)) => TaskResult::completed(&id, output, started_at, duration),
                    Ok(Err(err)) => {
                        TaskResult::failed(&id, err.to_string(), Some(started_at), duration)
                    }
                    Err(payload) => {
                        TaskResult::failed(&id, panic_message(payload), Some(started_at), duration)
                    }
                }
            });
        }
    }

    fn record(&mut self, result: TaskResult) {
        let id = result.task_id.clone();
        let status = result.status;
        match status {
            TaskStatus::Completed => info!(
                task = %id,
                duration_ms = result.duration.as_millis() as u64,
                "task completed"
            ),
            _ => error!(
                task = %id,
                duration_ms = result.duration.as_millis() as u64,
                error = result.error.as_deref().unwrap_or("unknown error"),
                "task failed"
            ),
        }

        match self.graph.add_result(result) {
            Ok(skipped) => {
                self.notify(&id, status);
                self.notify_all(&skipped, TaskStatus::Skipped);
            }
            Err(err) => warn!(task = %id, error = %err, "discarding task result"),
        }
    }

    /// Records a failure for every task still marked running once nothing
    /// is in flight. Returns how many were recorded.
    fn fail_lost_tasks(&mut self) -> usize {
        let lost = self.graph.running_ids();
        if !lost.is_empty() {
            error!(tasks = ?lost, "tasks finished without reporting a result");
        }
        for id in &lost {
            self.record(TaskResult::failed(id, REASON_LOST, None, Duration::ZERO));
        }
        lost.len()
    }

    fn skip_pending(&mut self, reason: &str) {
        let skipped = self.graph.skip_pending(reason);
        if !skipped.is_empty() {
            warn!(tasks = ?skipped, reason, "skipping tasks that never started");
        }
        self.notify_all(&skipped, TaskStatus::Skipped);
    }

    fn notify(&self, id: &str, status: TaskStatus) {
        if let Some(callback) = &self.progress {
            callback(id, status);
        }
    }

    fn notify_all(&self, ids: &[String], status: TaskStatus) {
        for id in ids {
            self.notify(id, status);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", message)
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ok_task(id: &str) -> Task {
        let output = id.to_string();
        Task::new(id, move || async move { Ok::<_, BoxError>(output) })
    }

    fn failing_task(id: &str) -> Task {
        Task::new(id, || async { Err::<serde_json::Value, BoxError>("agent exited with status 1".into()) })
    }

    // ==========================================================================
    // Config
    // ==========================================================================

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.run_timeout, None);
    }

    #[test]
    fn test_scheduler_config_from_timeouts() {
        let timeouts = TimeoutConfig::default().with_run_timeout(Duration::from_secs(5));
        let config = SchedulerConfig::from_timeouts(2, &timeouts);
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.run_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_panic_message_extracts_payload() {
        assert_eq!(panic_message(Box::new("bad")), "task panicked: bad");
        assert_eq!(
            panic_message(Box::new(String::from("worse"))),
            "task panicked: worse"
        );
        assert_eq!(panic_message(Box::new(5u8)), "task panicked");
    }

    // ==========================================================================
    // Execution
    // ==========================================================================

    #[tokio::test]
    async fn test_failed_root_skips_both_dependents() {
        let mut scheduler = TaskScheduler::new(SchedulerConfig::default());
        scheduler.add_task(failing_task("A")).expect("add A");
        scheduler.add_task(ok_task("B").depends_on(["A"])).expect("add B");
        scheduler.add_task(ok_task("C").depends_on(["A"])).expect("add C");

        let results = scheduler.execute().await.expect("execute");

        assert_eq!(results.len(), 3);
        assert_eq!(results["A"].status, TaskStatus::Failed);
        assert_eq!(results["B"].status, TaskStatus::Skipped);
        assert_eq!(results["C"].status, TaskStatus::Skipped);
        assert_eq!(
            results["A"].error.as_deref(),
            Some("agent exited with status 1")
        );
    }

    #[tokio::test]
    async fn test_outputs_are_recorded() {
        let mut scheduler = TaskScheduler::new(SchedulerConfig::new(2));
        scheduler
            .add_task(Task::new("count", || async { Ok::<_, BoxError>(json!({"files": 3})) }))
            .expect("add");

        let results = scheduler.execute().await.expect("execute");
        let result = &results["count"];
        assert!(result.is_success());
        assert_eq!(result.output, Some(json!({"files": 3})));
        assert!(result.started_at.is_some());
        assert!(result.finished_at >= result.started_at);
    }

    #[tokio::test]
    async fn test_panicking_task_is_recorded_as_failed() {
        let mut scheduler = TaskScheduler::new(SchedulerConfig::default());
        scheduler
            .add_task(Task::new("explode", || async {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, BoxError>(json!(null))
            }))
            .expect("add");
        scheduler.add_task(ok_task("sibling")).expect("add");

        let results = scheduler.execute().await.expect("execute");
        assert!(results["explode"].is_failed());
        assert!(results["explode"]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("kaboom"));
        assert!(results["sibling"].is_success());
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_dispatch() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut scheduler = TaskScheduler::new(SchedulerConfig::default());
        for (id, dep) in [("a", "b"), ("b", "a")] {
            let ran = Arc::clone(&ran);
            scheduler
                .add_task(
                    Task::new(id, move || async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(json!(null))
                    })
                    .depends_on([dep]),
                )
                .expect("add");
        }
        scheduler.add_task(ok_task("free")).expect("add");

        let err = scheduler.execute().await.expect_err("cycle");
        assert_eq!(
            err,
            SchedulerError::Cycle {
                tasks: vec!["a".to_string(), "b".to_string()]
            }
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(scheduler.graph().results().is_empty());
    }

    #[tokio::test]
    async fn test_scheduler_runs_once() {
        let mut scheduler = TaskScheduler::new(SchedulerConfig::default());
        scheduler.add_task(ok_task("a")).expect("add");
        scheduler.execute().await.expect("first run");

        assert_eq!(
            scheduler.execute().await.expect_err("second run"),
            SchedulerError::AlreadyExecuted
        );
        assert_eq!(
            scheduler.add_task(ok_task("b")).expect_err("late add"),
            SchedulerError::AlreadyExecuted
        );
    }

    #[tokio::test]
    async fn test_progress_callback_sees_every_transition() {
        let events: Arc<Mutex<Vec<(String, TaskStatus)>>> = Arc::default();
        let mut scheduler = TaskScheduler::new(SchedulerConfig::new(1));
        let sink = Arc::clone(&events);
        scheduler.set_progress_callback(move |id, status| {
            if let Ok(mut events) = sink.lock() {
                events.push((id.to_string(), status));
            }
        });
        scheduler.add_task(ok_task("a")).expect("add");
        scheduler.add_task(failing_task("b").depends_on(["a"])).expect("add");
        scheduler.add_task(ok_task("c").depends_on(["b"])).expect("add");

        scheduler.execute().await.expect("execute");

        let events = events.lock().expect("events").clone();
        assert_eq!(
            events,
            vec![
                ("a".to_string(), TaskStatus::Running),
                ("a".to_string(), TaskStatus::Completed),
                ("b".to_string(), TaskStatus::Running),
                ("b".to_string(), TaskStatus::Failed),
                ("c".to_string(), TaskStatus::Skipped),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_before_execute_skips_everything() {
        let mut scheduler = TaskScheduler::new(SchedulerConfig::default());
        scheduler.add_task(ok_task("a")).expect("add");
        scheduler.add_task(ok_task("b")).expect("add");
        let handle = scheduler.cancel_handle();
        handle.cancel();
        assert!(handle.is_cancelled());

        let results = scheduler.execute().await.expect("execute");
        assert!(results.values().all(|r| r.status == TaskStatus::Skipped));
        assert_eq!(results["a"].error.as_deref(), Some(REASON_CANCELLED));
    }

    #[test]
    fn test_cancel_handle_reports_cancel_without_a_run() {
        let scheduler = TaskScheduler::new(SchedulerConfig::default());
        let handle = scheduler.cancel_handle();
        assert!(!handle.is_cancelled());

        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(scheduler.cancel_handle().is_cancelled());
    }

    #[test]
    fn test_lost_task_recorded_failed_and_dependents_skipped() {
        let mut scheduler = TaskScheduler::new(SchedulerConfig::default());
        scheduler.add_task(ok_task("a")).expect("add");
        scheduler.add_task(ok_task("b").depends_on(["a"])).expect("add");
        let taken = scheduler.graph.take_ready(1);
        assert_eq!(taken.len(), 1);
        assert_eq!(scheduler.graph.status("a"), Some(TaskStatus::Running));

        assert_eq!(scheduler.fail_lost_tasks(), 1);

        assert_eq!(scheduler.graph.status("a"), Some(TaskStatus::Failed));
        assert_eq!(
            scheduler.graph.result("a").and_then(|r| r.error.as_deref()),
            Some(REASON_LOST)
        );
        assert_eq!(scheduler.graph.status("b"), Some(TaskStatus::Skipped));
        assert!(scheduler.graph.is_complete());
        assert_eq!(scheduler.fail_lost_tasks(), 0);
    }

    #[tokio::test]
    async fn test_run_timeout_fails_running_and_skips_pending() {
        let mut scheduler = TaskScheduler::new(
            SchedulerConfig::new(1).with_run_timeout(Duration::from_millis(50)),
        );
        scheduler.add_task(ok_task("quick")).expect("add");
        scheduler
            .add_task(
                Task::new("slow", || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, BoxError>(json!(null))
                })
                .depends_on(["quick"]),
            )
            .expect("add");
        scheduler.add_task(ok_task("after").depends_on(["slow"])).expect("add");

        let results = scheduler.execute().await.expect("execute");

        assert!(results["quick"].is_success());
        assert!(results["slow"].is_failed());
        assert!(results["slow"]
            .error
            .as_deref()
            .unwrap_or_default()
            .starts_with("run timed out"));
        assert_eq!(results["after"].status, TaskStatus::Skipped);
        assert!(scheduler.elapsed().expect("elapsed") < Duration::from_secs(5));
    }
}
