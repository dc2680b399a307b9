//! Dependency graph for one scheduling run.
//!
//! The graph owns every task's status, its pending work and its recorded
//! result. Only the scheduler's dispatch loop mutates it; task closures never
//! see it.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::task::{Task, TaskResult, TaskStatus, Work};

/// Configuration and bookkeeping errors raised by the graph or scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Task '{0}' already exists")]
    DuplicateTask(String),

    #[error("Task '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    MissingDependency { task: String, dependency: String },

    #[error("Dependency cycle detected between tasks: {}", .tasks.join(", "))]
    Cycle { tasks: Vec<String> },

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Task '{0}' already has a recorded result")]
    DuplicateResult(String),

    #[error("Scheduler has already run; build a new one for the next run")]
    AlreadyExecuted,
}

struct Node {
    dependencies: Vec<String>,
    metadata: BTreeMap<String, String>,
    status: TaskStatus,
    work: Option<Work>,
}

/// A task handed to the dispatcher, already marked running.
pub struct ReadyTask {
    pub id: String,
    pub metadata: BTreeMap<String, String>,
    pub(crate) work: Work,
}

/// Counts over a run's results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Sum of every task's own duration.
    pub total_duration: Duration,
    /// Completed tasks as a percentage of all tasks.
    pub success_rate: f64,
}

#[derive(Default)]
pub struct DependencyGraph {
    order: Vec<String>,
    nodes: HashMap<String, Node>,
    dependents: HashMap<String, Vec<String>>,
    results: HashMap<String, TaskResult>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task. Dependencies may name tasks added later; they are
    /// checked by [`DependencyGraph::validate`].
    pub fn add_task(&mut self, task: Task) -> Result<(), SchedulerError> {
        let Task {
            id,
            dependencies,
            metadata,
            work,
        } = task;

        if self.nodes.contains_key(&id) {
            return Err(SchedulerError::DuplicateTask(id));
        }
        if dependencies.contains(&id) {
            return Err(SchedulerError::SelfDependency(id));
        }

        for dependency in &dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .push(id.clone());
        }
        debug!(task = %id, dependencies = dependencies.len(), "task added");

        self.order.push(id.clone());
        self.nodes.insert(
            id,
            Node {
                dependencies,
                metadata,
                status: TaskStatus::Pending,
                work: Some(work),
            },
        );
        Ok(())
    }

    /// Rejects dependencies on unknown tasks and dependency cycles.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        for id in &self.order {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if let Some(missing) = node
                .dependencies
                .iter()
                .find(|dependency| !self.nodes.contains_key(*dependency))
            {
                return Err(SchedulerError::MissingDependency {
                    task: id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let indices: HashMap<&str, NodeIndex> = self
            .order
            .iter()
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();
        for id in &self.order {
            let (Some(node), Some(&to)) = (self.nodes.get(id), indices.get(id.as_str())) else {
                continue;
            };
            for dependency in &node.dependencies {
                if let Some(&from) = indices.get(dependency.as_str()) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                let mut ids: Vec<String> = component
                    .into_iter()
                    .filter_map(|index| graph.node_weight(index))
                    .map(|id| id.to_string())
                    .collect();
                ids.sort();
                ids
            })
            .collect();
        cycles.sort();

        match cycles.into_iter().next() {
            Some(tasks) => Err(SchedulerError::Cycle { tasks }),
            None => Ok(()),
        }
    }

    /// Ids of pending tasks whose every dependency has completed, in
    /// submission order.
    pub fn get_ready_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.is_ready(id))
            .cloned()
            .collect()
    }

    /// Takes up to `limit` ready tasks, marking each as running. A task is
    /// handed out at most once.
    pub fn take_ready(&mut self, limit: usize) -> Vec<ReadyTask> {
        let ids: Vec<String> = self.get_ready_tasks().into_iter().take(limit).collect();
        let mut ready = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let Some(work) = node.work.take() else {
                continue;
            };
            node.status = TaskStatus::Running;
            ready.push(ReadyTask {
                id,
                metadata: node.metadata.clone(),
                work,
            });
        }
        ready
    }

    /// Records a terminal result. When the task did not complete, every
    /// pending transitive dependent is marked skipped; their ids are
    /// returned.
    pub fn add_result(&mut self, result: TaskResult) -> Result<Vec<String>, SchedulerError> {
        let id = result.task_id.clone();
        let Some(node) = self.nodes.get_mut(&id) else {
            return Err(SchedulerError::UnknownTask(id));
        };
        if self.results.contains_key(&id) {
            return Err(SchedulerError::DuplicateResult(id));
        }

        node.status = result.status;
        node.work = None;
        let completed = result.is_success();
        self.results.insert(id.clone(), result);

        if completed {
            Ok(Vec::new())
        } else {
            Ok(self.skip_dependents_of(&id))
        }
    }

    /// Marks every pending task skipped with `reason`. Returns their ids.
    pub fn skip_pending(&mut self, reason: &str) -> Vec<String> {
        self.finish_where(TaskStatus::Pending, |id| TaskResult::skipped(id, reason))
    }

    /// Marks every pending task failed with `reason`. Used when the run can
    /// make no further progress. Returns their ids.
    pub fn fail_pending(&mut self, reason: &str) -> Vec<String> {
        self.finish_where(TaskStatus::Pending, |id| {
            TaskResult::failed(id, reason, None, Duration::ZERO)
        })
    }

    /// Marks every running task failed with `reason`, for work that was
    /// aborted before it could report. Returns their ids.
    pub fn fail_running(&mut self, reason: &str) -> Vec<String> {
        self.finish_where(TaskStatus::Running, |id| {
            TaskResult::failed(id, reason, None, Duration::ZERO)
        })
    }

    /// Ids of tasks marked running, in submission order.
    pub fn running_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.status(id) == Some(TaskStatus::Running))
            .cloned()
            .collect()
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.nodes.get(id).map(|node| node.status)
    }

    pub fn result(&self, id: &str) -> Option<&TaskResult> {
        self.results.get(id)
    }

    pub fn results(&self) -> &HashMap<String, TaskResult> {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether every task has a terminal result.
    pub fn is_complete(&self) -> bool {
        self.order.iter().all(|id| self.results.contains_key(id))
    }

    pub fn has_failures(&self) -> bool {
        self.results.values().any(TaskResult::is_failed)
    }

    pub fn running_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| node.status == TaskStatus::Running)
            .count()
    }

    pub fn summary(&self) -> RunSummary {
        let total = self.order.len();
        let completed = self.results.values().filter(|r| r.is_success()).count();
        let failed = self.results.values().filter(|r| r.is_failed()).count();
        let skipped = self
            .results
            .values()
            .filter(|r| r.status == TaskStatus::Skipped)
            .count();
        let total_duration: Duration = self.results.values().map(|r| r.duration).sum();
        let success_rate = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64 * 100.0
        };

        RunSummary {
            total,
            completed,
            failed,
            skipped,
            total_duration,
            success_rate,
        }
    }

    fn is_ready(&self, id: &str) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        node.status == TaskStatus::Pending
            && node.dependencies.iter().all(|dependency| {
                self.results
                    .get(dependency)
                    .is_some_and(TaskResult::is_success)
            })
    }

    fn skip_dependents_of(&mut self, root: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        let mut stack = vec![root.to_string()];

        while let Some(upstream) = stack.pop() {
            let Some(dependents) = self.dependents.get(&upstream).cloned() else {
                continue;
            };
            for dependent in dependents {
                let Some(node) = self.nodes.get_mut(&dependent) else {
                    continue;
                };
                if node.status != TaskStatus::Pending {
                    continue;
                }
                node.status = TaskStatus::Skipped;
                node.work = None;
                let reason = format!("dependency '{}' did not complete", upstream);
                warn!(task = %dependent, dependency = %upstream, "skipping task");
                self.results
                    .insert(dependent.clone(), TaskResult::skipped(&dependent, reason));
                skipped.push(dependent.clone());
                stack.push(dependent);
            }
        }
        skipped
    }

    fn finish_where(
        &mut self,
        status: TaskStatus,
        make_result: impl Fn(&str) -> TaskResult,
    ) -> Vec<String> {
        let mut finished = Vec::new();
        for id in &self.order {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            if node.status != status || self.results.contains_key(id) {
                continue;
            }
            let result = make_result(id);
            node.status = result.status;
            node.work = None;
            self.results.insert(id.clone(), result);
            finished.push(id.clone());
        }
        finished
    }
}
