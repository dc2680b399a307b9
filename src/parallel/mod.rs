//! Dependency-aware parallel task execution.
//!
//! Build a [`TaskScheduler`], add [`Task`]s with their dependencies, then
//! call [`TaskScheduler::execute`]. Every task ends the run with exactly one
//! [`TaskResult`]: completed, failed, or skipped because something upstream
//! did not complete.

pub mod dependency;
pub mod scheduler;
pub mod task;

pub use dependency::{DependencyGraph, ReadyTask, RunSummary, SchedulerError};
pub use scheduler::{CancelHandle, ProgressCallback, SchedulerConfig, TaskScheduler};
pub use task::{Task, TaskFuture, TaskResult, TaskStatus};
