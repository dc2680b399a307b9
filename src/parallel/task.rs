//! Schedulable units of work and their recorded outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BoxError;

/// Future produced by a task's work.
pub type TaskFuture = BoxFuture<'static, Result<Value, BoxError>>;

pub(crate) type Work = Box<dyn FnOnce() -> TaskFuture + Send + 'static>;

/// Lifecycle status of a task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One unit of work with the ids it waits for.
///
/// The work closure is invoked at most once, by the scheduler, after every
/// dependency has completed.
pub struct Task {
    pub(crate) id: String,
    pub(crate) dependencies: Vec<String>,
    pub(crate) metadata: BTreeMap<String, String>,
    pub(crate) work: Work,
}

impl Task {
    /// Creates a task from an async closure.
    pub fn new<F, Fut, T, E>(id: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Into<Value> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            metadata: BTreeMap::new(),
            work: Box::new(move || -> TaskFuture {
                let pending = work();
                Box::pin(async move {
                    let output: Result<Value, BoxError> = match pending.await {
                        Ok(value) => Ok(value.into()),
                        Err(err) => Err(err.into()),
                    };
                    output
                })
            }),
        }
    }

    /// Creates a task from a synchronous closure. The closure runs on the
    /// blocking thread pool so it never stalls other tasks.
    pub fn blocking<F, T, E>(id: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Into<Value> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        Self::new(id, move || async move {
            let output: Result<Value, BoxError> = match tokio::task::spawn_blocking(work).await {
                Ok(Ok(value)) => Ok(value.into()),
                Ok(Err(err)) => Err(err.into()),
                Err(join_error) => Err(Box::new(join_error)),
            };
            output
        })
    }

    /// Adds dependencies that must complete before this task starts.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dependency in dependencies {
            let dependency = dependency.into();
            if !self.dependencies.contains(&dependency) {
                self.dependencies.push(dependency);
            }
        }
        self
    }

    /// Attaches a free-form annotation, carried into logs.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Recorded outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn completed(
        task_id: impl Into<String>,
        output: Value,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            output: Some(output),
            error: None,
            duration,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        error: impl Into<String>,
        started_at: Option<DateTime<Utc>>,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            output: None,
            error: Some(error.into()),
            duration,
            started_at,
            finished_at: Some(Utc::now()),
        }
    }

    /// A task that never ran.
    pub fn skipped(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            duration: Duration::ZERO,
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
