//! The build engine: walks a task DAG and drives it to completion.
//!
//! One state machine serves all three execution modes; the modes differ
//! only in how many executions are in flight and where they run
//! (sequential: one at a time, deterministic; cooperative: bounded
//! in-flight futures on the current runtime task; parallel: spawned onto
//! the multi-threaded runtime).

mod driver;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::TaskError;
use crate::lock_manager::{GlobalLockConfig, LockManager};
use crate::registry::Registry;
use crate::task::TaskRef;

pub use driver::build;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Any task failure aborts the build; in-flight tasks finish but no new
    /// tasks start.
    FailFast,
    /// Failed tasks and their transitive descendants are skipped; other
    /// branches proceed. The build is reported failed if any task failed.
    FailAtEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Sequential,
    /// Single runtime task, bounded number of suspended-at-I/O executions.
    Cooperative { max_in_flight: usize },
    /// Bounded worker pool on the multi-threaded runtime.
    Parallel { workers: usize },
}

impl Concurrency {
    pub(crate) fn bound(&self) -> usize {
        match self {
            Concurrency::Sequential => 1,
            Concurrency::Cooperative { max_in_flight } => (*max_in_flight).max(1),
            Concurrency::Parallel { workers } => (*workers).max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub concurrency: Concurrency,
    pub fail_mode: FailMode,
    pub lock: GlobalLockConfig,
    /// Emit events against an existing build instead of creating one;
    /// tasks already completed in that build are not re-executed.
    pub resume_build_id: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::Sequential,
            fail_mode: FailMode::FailFast,
            lock: GlobalLockConfig::default(),
            resume_build_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCount {
    pub discovered: usize,
    pub previously_completed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildExitStatus {
    Success,
    Failure,
}

#[derive(Debug)]
pub struct BuildSummary {
    pub status: BuildExitStatus,
    pub task_count: TaskCount,
    /// None when the build failed before a registry build was created.
    pub build_id: Option<String>,
    pub error: Option<String>,
}

/// Debug/test entry point: one task at a time in deterministic order.
pub async fn build_sequential(
    tasks: Vec<TaskRef>,
    registry: Arc<dyn Registry>,
) -> BuildSummary {
    build(tasks, registry, None, BuildConfig::default()).await
}

/// Bounded worker pool with default failure handling.
pub async fn build_parallel(
    tasks: Vec<TaskRef>,
    registry: Arc<dyn Registry>,
    workers: usize,
) -> BuildSummary {
    build(
        tasks,
        registry,
        None,
        BuildConfig {
            concurrency: Concurrency::Parallel { workers },
            ..BuildConfig::default()
        },
    )
    .await
}

/// Convenience for globally-locked builds.
pub async fn build_with_locks(
    tasks: Vec<TaskRef>,
    registry: Arc<dyn Registry>,
    lock_manager: Arc<dyn LockManager>,
    config: BuildConfig,
) -> BuildSummary {
    build(tasks, registry, Some(lock_manager), config).await
}

/// A task suspended on a yielded batch of dynamic dependencies.
#[derive(Debug)]
pub(crate) struct Suspended {
    /// Phase to resume `run` with once the batch completes.
    pub phase: usize,
    pub waiting_on: HashSet<String>,
}

/// In-memory view of the DAG as the engine walks it, keyed by task id.
#[derive(Default)]
pub(crate) struct BuildState {
    pub all_tasks: HashMap<String, TaskRef>,
    /// Discovery order; the sequential mode's deterministic pick order.
    pub order: Vec<String>,
    pub static_deps: HashMap<String, Vec<String>>,
    pub completed: HashSet<String>,
    pub failed: HashSet<String>,
    pub running: HashSet<String>,
    pub suspended: HashMap<String, Suspended>,
}

impl BuildState {
    /// Depth-first discovery that stops descending below already-complete
    /// tasks: their subtrees need not run.
    pub async fn discover(
        &mut self,
        root: TaskRef,
        counts: &mut TaskCount,
        previously_completed: &mut Vec<TaskRef>,
    ) -> Result<Vec<TaskRef>, TaskError> {
        let mut newly_discovered = Vec::new();
        let mut stack = vec![root];
        while let Some(task) = stack.pop() {
            let id = task.id();
            if self.all_tasks.contains_key(&id) {
                continue;
            }
            self.all_tasks.insert(id.clone(), task.clone());
            self.order.push(id.clone());
            counts.discovered += 1;
            newly_discovered.push(task.clone());

            if task.complete().await? {
                self.completed.insert(id);
                counts.previously_completed += 1;
                previously_completed.push(task);
                continue;
            }

            let deps = task.requires();
            self.static_deps
                .insert(id, deps.iter().map(|d| d.id()).collect());
            stack.extend(deps);
        }
        Ok(newly_discovered)
    }

    /// First ready task in discovery order: all static dependencies
    /// completed, or a suspended task whose yielded batch has drained.
    pub fn next_ready(&self) -> Option<String> {
        for id in &self.order {
            if self.completed.contains(id)
                || self.failed.contains(id)
                || self.running.contains(id)
            {
                continue;
            }
            if let Some(suspended) = self.suspended.get(id) {
                if suspended.waiting_on.is_empty() {
                    return Some(id.clone());
                }
                continue;
            }
            let deps = match self.static_deps.get(id) {
                Some(deps) => deps,
                None => continue,
            };
            if deps.iter().any(|d| self.failed.contains(d)) {
                // Blocked by a failed dependency; skipped under fail-at-end.
                continue;
            }
            if deps.iter().all(|d| self.completed.contains(d)) {
                return Some(id.clone());
            }
        }
        None
    }

    pub fn mark_completed(&mut self, id: &str) {
        self.completed.insert(id.to_string());
        for suspended in self.suspended.values_mut() {
            suspended.waiting_on.remove(id);
        }
    }

    /// Dependency-first order over everything discovered so far, so
    /// upstream tasks register before their dependents and edges resolve.
    pub fn registration_order(&self, roots: &[TaskRef]) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        for root in roots {
            self.visit_post_order(&root.id(), &mut visited, &mut out);
        }
        // Tasks reachable only through dynamic batches.
        for id in &self.order {
            self.visit_post_order(id, &mut visited, &mut out);
        }
        out
    }

    fn visit_post_order(
        &self,
        id: &str,
        visited: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !visited.insert(id.to_string()) {
            return;
        }
        if let Some(deps) = self.static_deps.get(id) {
            for dep in deps {
                self.visit_post_order(dep, visited, out);
            }
        }
        out.push(id.to_string());
    }
}
