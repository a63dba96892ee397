//! The scheduling loop shared by all execution modes, and the per-task
//! execution step (lock coordination, lifecycle reporting, dynamic-dep
//! suspension).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::lock_manager::{GlobalLockConfig, LockAttempt, LockManager};
use crate::registry::Registry;
use crate::task::{RunOutcome, TaskRef};

use super::{
    BuildConfig, BuildExitStatus, BuildState, BuildSummary, Concurrency, FailMode, Suspended,
    TaskCount,
};

struct ExecResult {
    task_id: String,
    phase: usize,
    outcome: ExecOutcome,
}

enum ExecOutcome {
    Completed,
    /// The lock service reported the task completed elsewhere.
    SkippedAlreadyCompleted,
    Failed(String),
    /// Dynamic dependencies were yielded; resume after they complete.
    Suspended(Vec<TaskRef>),
}

#[derive(Clone)]
struct LockCtx {
    manager: Arc<dyn LockManager>,
    config: GlobalLockConfig,
    /// Locks currently held by this build process; shared with the renewer.
    held: Arc<Mutex<HashSet<String>>>,
}

/// Execute a DAG. See [`super::BuildConfig`] for mode, failure handling,
/// lock coordination and resume options.
pub async fn build(
    roots: Vec<TaskRef>,
    registry: Arc<dyn Registry>,
    lock_manager: Option<Arc<dyn LockManager>>,
    config: BuildConfig,
) -> BuildSummary {
    let mut state = BuildState::default();
    let mut counts = TaskCount::default();
    let mut previously_completed = Vec::new();

    for root in &roots {
        if let Err(e) = state
            .discover(root.clone(), &mut counts, &mut previously_completed)
            .await
        {
            return BuildSummary {
                status: BuildExitStatus::Failure,
                task_count: counts,
                build_id: None,
                error: Some(format!("discovery failed: {e}")),
            };
        }
    }

    // Start or resume the build.
    let build_id = match &config.resume_build_id {
        Some(id) => id.clone(),
        None => match registry.build_start(&roots).await {
            Ok(id) => id,
            Err(e) => {
                return BuildSummary {
                    status: BuildExitStatus::Failure,
                    task_count: counts,
                    build_id: None,
                    error: Some(format!("failed to start build: {e}")),
                }
            }
        },
    };

    if config.resume_build_id.is_some() {
        match registry.completed_task_ids(&build_id).await {
            Ok(done) => {
                for id in done {
                    if state.all_tasks.contains_key(&id) && !state.completed.contains(&id) {
                        state.mark_completed(&id);
                        counts.previously_completed += 1;
                    }
                }
            }
            Err(e) => log::warn!("could not load completed tasks for resume: {e}"),
        }
    }

    // Register everything discovered so far, dependencies first. Best
    // effort: a registration failure must not kill the build.
    for id in state.registration_order(&roots) {
        let task = state.all_tasks[&id].clone();
        if let Err(e) = registry.task_register(&build_id, task.as_ref()).await {
            log::warn!("failed to register task {id}: {e}");
        }
    }

    let lock_ctx = lock_manager
        .filter(|_| config.lock.enabled)
        .map(|manager| LockCtx {
            manager,
            config: config.lock.clone(),
            held: Arc::new(Mutex::new(HashSet::new())),
        });
    let renewer = lock_ctx.as_ref().map(spawn_renewer);

    let bound = config.concurrency.bound();
    let spawn_executions = matches!(config.concurrency, Concurrency::Parallel { .. });
    let mut in_flight: FuturesUnordered<BoxFuture<'static, ExecResult>> =
        FuturesUnordered::new();
    let mut error: Option<String> = None;
    let mut aborting = false;

    loop {
        while !aborting && in_flight.len() < bound {
            let Some(id) = state.next_ready() else { break };
            let task = state.all_tasks[&id].clone();
            let phase = state.suspended.remove(&id).map(|s| s.phase).unwrap_or(0);
            state.running.insert(id.clone());

            let lock = lock_ctx.clone().filter(|_| task.lockable());
            let fut = execute_task(
                task,
                id.clone(),
                phase,
                build_id.clone(),
                registry.clone(),
                lock,
            );
            if spawn_executions {
                let fallback_id = id.clone();
                in_flight.push(Box::pin(async move {
                    match tokio::spawn(fut).await {
                        Ok(result) => result,
                        Err(e) => ExecResult {
                            task_id: fallback_id,
                            phase,
                            outcome: ExecOutcome::Failed(format!("task panicked: {e}")),
                        },
                    }
                }));
            } else {
                in_flight.push(Box::pin(fut));
            }
        }

        let Some(result) = in_flight.next().await else { break };
        state.running.remove(&result.task_id);

        match result.outcome {
            ExecOutcome::Completed => {
                counts.succeeded += 1;
                state.mark_completed(&result.task_id);
            }
            ExecOutcome::SkippedAlreadyCompleted => {
                counts.previously_completed += 1;
                state.mark_completed(&result.task_id);
            }
            ExecOutcome::Failed(message) => {
                counts.failed += 1;
                state.failed.insert(result.task_id.clone());
                if error.is_none() {
                    error = Some(message);
                }
                cascade_fail_suspended(
                    &mut state,
                    &mut counts,
                    &result.task_id,
                    &build_id,
                    &registry,
                    &lock_ctx,
                )
                .await;
                if config.fail_mode == FailMode::FailFast {
                    aborting = true;
                }
            }
            ExecOutcome::Suspended(batch) => {
                let mut waiting_on = HashSet::new();
                let mut discovery_error = None;
                for dep in batch {
                    match state
                        .discover(dep.clone(), &mut counts, &mut previously_completed)
                        .await
                    {
                        Ok(newly_discovered) => {
                            for task in newly_discovered {
                                if let Err(e) =
                                    registry.task_register(&build_id, task.as_ref()).await
                                {
                                    log::warn!("failed to register dynamic dep: {e}");
                                }
                            }
                            let dep_id = dep.id();
                            if !state.completed.contains(&dep_id) {
                                waiting_on.insert(dep_id);
                            }
                        }
                        Err(e) => {
                            discovery_error = Some(format!("dynamic dep discovery failed: {e}"));
                            break;
                        }
                    }
                }

                match discovery_error {
                    Some(message) => {
                        counts.failed += 1;
                        state.failed.insert(result.task_id.clone());
                        fail_task_remotely(
                            &state,
                            &result.task_id,
                            &build_id,
                            &registry,
                            &lock_ctx,
                            &message,
                        )
                        .await;
                        if error.is_none() {
                            error = Some(message);
                        }
                        if config.fail_mode == FailMode::FailFast {
                            aborting = true;
                        }
                    }
                    None => {
                        state.suspended.insert(
                            result.task_id.clone(),
                            Suspended {
                                phase: result.phase + 1,
                                waiting_on,
                            },
                        );
                    }
                }
            }
        }
    }

    if let Some(renewer) = renewer {
        renewer.abort();
    }

    // Locks still held here belong to tasks stranded by an abort (their
    // yielded deps never completed). Release rather than wait out the TTL.
    if let Some(ctx) = &lock_ctx {
        let leftovers: Vec<String> = ctx.held.lock().await.drain().collect();
        for name in leftovers {
            if let Err(e) = ctx.manager.release(&name, None).await {
                log::warn!("failed to release leftover lock {name}: {e}");
            }
        }
    }

    let status = match &error {
        None => {
            if let Err(e) = registry.build_complete(&build_id).await {
                log::warn!("failed to record build completion: {e}");
            }
            BuildExitStatus::Success
        }
        Some(message) => {
            if let Err(e) = registry.build_fail(&build_id, Some(message)).await {
                log::warn!("failed to record build failure: {e}");
            }
            BuildExitStatus::Failure
        }
    };

    BuildSummary {
        status,
        task_count: counts,
        build_id: Some(build_id),
        error,
    }
}

/// Fail every suspended task transitively waiting on `failed_id`: its
/// yielded batch can never complete, so it must release its lock and be
/// reported failed rather than hang.
async fn cascade_fail_suspended(
    state: &mut BuildState,
    counts: &mut TaskCount,
    failed_id: &str,
    build_id: &str,
    registry: &Arc<dyn Registry>,
    lock_ctx: &Option<LockCtx>,
) {
    let mut queue = vec![failed_id.to_string()];
    while let Some(fid) = queue.pop() {
        let parents: Vec<String> = state
            .suspended
            .iter()
            .filter(|(_, s)| s.waiting_on.contains(&fid))
            .map(|(id, _)| id.clone())
            .collect();
        for parent in parents {
            state.suspended.remove(&parent);
            state.failed.insert(parent.clone());
            counts.failed += 1;
            fail_task_remotely(
                state,
                &parent,
                build_id,
                registry,
                lock_ctx,
                "dynamic dependency failed",
            )
            .await;
            queue.push(parent);
        }
    }
}

async fn fail_task_remotely(
    state: &BuildState,
    task_id: &str,
    build_id: &str,
    registry: &Arc<dyn Registry>,
    lock_ctx: &Option<LockCtx>,
    message: &str,
) {
    if let Some(task) = state.all_tasks.get(task_id) {
        if let Err(e) = registry.task_fail(build_id, task.as_ref(), message).await {
            log::warn!("failed to record task failure for {task_id}: {e}");
        }
    }
    if let Some(ctx) = lock_ctx {
        let was_held = ctx.held.lock().await.remove(task_id);
        if was_held {
            if let Err(e) = ctx.manager.release(task_id, None).await {
                log::warn!("failed to release lock for {task_id}: {e}");
            }
        }
    }
}

/// Renew every held lock at half the TTL so long-running tasks keep their
/// leases alive.
fn spawn_renewer(ctx: &LockCtx) -> JoinHandle<()> {
    let held = ctx.held.clone();
    let manager = ctx.manager.clone();
    let interval =
        std::time::Duration::from_secs((manager.ttl_seconds() / 2).max(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let names: Vec<String> = held.lock().await.iter().cloned().collect();
            for name in names {
                match manager.renew(&name).await {
                    Ok(true) => {}
                    Ok(false) => log::warn!("lost lock {name} before renewal"),
                    Err(e) => log::warn!("failed to renew lock {name}: {e}"),
                }
            }
        }
    })
}

/// One execution step of a task: acquire the lock on the first phase, emit
/// TASK_STARTED, run the phase, and translate the outcome. Completion under
/// a lock goes through release-with-completion so the event and the unlock
/// commit atomically.
async fn execute_task(
    task: TaskRef,
    task_id: String,
    phase: usize,
    build_id: String,
    registry: Arc<dyn Registry>,
    lock: Option<LockCtx>,
) -> ExecResult {
    let result = |outcome| ExecResult {
        task_id: task_id.clone(),
        phase,
        outcome,
    };

    if phase == 0 {
        if let Some(ctx) = &lock {
            let already_held = ctx.held.lock().await.contains(&task_id);
            if !already_held {
                match acquire_with_retry(&task, &task_id, ctx).await {
                    Ok(LockAttempt::Acquired) => {
                        ctx.held.lock().await.insert(task_id.clone());
                    }
                    Ok(LockAttempt::AlreadyCompleted) => {
                        return result(ExecOutcome::SkippedAlreadyCompleted);
                    }
                    Ok(refused) => {
                        let message = format!("failed to acquire lock: {refused:?}");
                        if let Err(e) =
                            registry.task_fail(&build_id, task.as_ref(), &message).await
                        {
                            log::warn!("failed to record lock failure: {e}");
                        }
                        return result(ExecOutcome::Failed(message));
                    }
                    Err(message) => {
                        if let Err(e) =
                            registry.task_fail(&build_id, task.as_ref(), &message).await
                        {
                            log::warn!("failed to record lock failure: {e}");
                        }
                        return result(ExecOutcome::Failed(message));
                    }
                }
            }
        }

        if let Err(e) = registry.task_start(&build_id, task.as_ref()).await {
            let message = format!("failed to record task start: {e}");
            release_if_held(&lock, &task_id, None).await;
            return result(ExecOutcome::Failed(message));
        }
    }

    match task.run(phase).await {
        Ok(RunOutcome::Finished) => {
            let completion_recorded = if lock_is_held(&lock, &task_id).await {
                // Completion event and unlock in one registry transaction.
                release_if_held(&lock, &task_id, Some(&build_id)).await
            } else {
                false
            };
            if !completion_recorded {
                if let Err(e) = registry.task_complete(&build_id, task.as_ref()).await {
                    return result(ExecOutcome::Failed(format!(
                        "failed to record task completion: {e}"
                    )));
                }
            }

            let assets = task.registry_assets();
            if !assets.is_empty() {
                if let Err(e) = registry
                    .task_upload_assets(&build_id, task.as_ref(), assets)
                    .await
                {
                    log::warn!("failed to upload registry assets for {task_id}: {e}");
                }
            }

            result(ExecOutcome::Completed)
        }
        Ok(RunOutcome::Deps(batch)) => result(ExecOutcome::Suspended(batch)),
        Err(e) => {
            let message = e.to_string();
            if let Err(report) = registry.task_fail(&build_id, task.as_ref(), &message).await {
                log::warn!("failed to record task failure: {report}");
            }
            release_if_held(&lock, &task_id, None).await;
            result(ExecOutcome::Failed(message))
        }
    }
}

async fn lock_is_held(lock: &Option<LockCtx>, task_id: &str) -> bool {
    match lock {
        Some(ctx) => ctx.held.lock().await.contains(task_id),
        None => false,
    }
}

/// Returns true only when a release-with-completion actually recorded the
/// completion event.
async fn release_if_held(
    lock: &Option<LockCtx>,
    task_id: &str,
    completed_build_id: Option<&str>,
) -> bool {
    let Some(ctx) = lock else { return false };
    let was_held = ctx.held.lock().await.remove(task_id);
    if !was_held {
        return false;
    }
    match ctx.manager.release(task_id, completed_build_id).await {
        Ok(released) => {
            if !released {
                log::warn!("lock {task_id} was no longer owned at release");
            }
            released && completed_build_id.is_some()
        }
        Err(e) => {
            log::warn!("failed to release lock {task_id}: {e}");
            false
        }
    }
}

/// Poll the lock service with exponential backoff, bounded by the
/// configured wait timeout. Between attempts the task's own completeness
/// is re-checked in case another worker finished it during the wait.
async fn acquire_with_retry(
    task: &TaskRef,
    task_id: &str,
    ctx: &LockCtx,
) -> Result<LockAttempt, String> {
    let start = Instant::now();
    let mut interval = ctx.config.wait_initial_interval;

    loop {
        let attempt = ctx
            .manager
            .acquire(task_id, true)
            .await
            .map_err(|e| format!("lock service error: {e}"))?;

        match attempt {
            LockAttempt::Acquired | LockAttempt::AlreadyCompleted => return Ok(attempt),
            LockAttempt::HeldByOther | LockAttempt::ConcurrencyLimitReached => {
                let Some(timeout) = ctx.config.wait_timeout else {
                    return Ok(attempt);
                };
                if start.elapsed() >= timeout {
                    return Err(format!(
                        "timeout after {}s waiting for lock: {attempt:?}",
                        timeout.as_secs()
                    ));
                }
                if task.complete().await.unwrap_or(false) {
                    return Ok(LockAttempt::AlreadyCompleted);
                }
                log::debug!("lock {task_id} unavailable ({attempt:?}), retrying in {interval:?}");
                tokio::time::sleep(interval).await;
                interval = ctx.config.next_interval(interval);
            }
        }
    }
}
