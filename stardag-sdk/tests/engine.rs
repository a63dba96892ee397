//! Build-engine behavior against in-memory registry and lock-manager
//! doubles: ordering, failure modes, dynamic dependencies, lock
//! coordination and resume.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use stardag_sdk::{
    build, build_parallel, build_sequential, BuildConfig, BuildExitStatus, Concurrency, FailMode,
    GlobalLockConfig, LockAttempt, LockManager, Registry, RunOutcome, Task, TaskRef,
};
use stardag_sdk::error::{RegistryClientError, TaskError};
use stardag_types::AssetUpload;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Recorded {
    BuildStart,
    BuildComplete,
    BuildFail(String),
    Register(String),
    Start(String),
    Complete(String),
    Fail(String),
}

#[derive(Default)]
struct MemRegistry {
    log: Mutex<Vec<Recorded>>,
    resume_completed: Mutex<HashSet<String>>,
}

impl MemRegistry {
    fn events(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    fn names_for(&self, pick: impl Fn(&Recorded) -> Option<String>) -> Vec<String> {
        self.events().iter().filter_map(pick).collect()
    }
}

#[async_trait]
impl Registry for MemRegistry {
    async fn build_start(&self, _roots: &[TaskRef]) -> Result<String, RegistryClientError> {
        self.log.lock().unwrap().push(Recorded::BuildStart);
        Ok("build-1".to_string())
    }

    async fn build_complete(&self, _build_id: &str) -> Result<(), RegistryClientError> {
        self.log.lock().unwrap().push(Recorded::BuildComplete);
        Ok(())
    }

    async fn build_fail(
        &self,
        _build_id: &str,
        error_message: Option<&str>,
    ) -> Result<(), RegistryClientError> {
        self.log
            .lock()
            .unwrap()
            .push(Recorded::BuildFail(error_message.unwrap_or("").to_string()));
        Ok(())
    }

    async fn task_register(
        &self,
        _build_id: &str,
        task: &dyn Task,
    ) -> Result<(), RegistryClientError> {
        self.log.lock().unwrap().push(Recorded::Register(task.name()));
        Ok(())
    }

    async fn task_start(
        &self,
        _build_id: &str,
        task: &dyn Task,
    ) -> Result<(), RegistryClientError> {
        self.log.lock().unwrap().push(Recorded::Start(task.name()));
        Ok(())
    }

    async fn task_complete(
        &self,
        _build_id: &str,
        task: &dyn Task,
    ) -> Result<(), RegistryClientError> {
        self.log.lock().unwrap().push(Recorded::Complete(task.name()));
        Ok(())
    }

    async fn task_fail(
        &self,
        _build_id: &str,
        task: &dyn Task,
        _error_message: &str,
    ) -> Result<(), RegistryClientError> {
        self.log.lock().unwrap().push(Recorded::Fail(task.name()));
        Ok(())
    }

    async fn task_upload_assets(
        &self,
        _build_id: &str,
        _task: &dyn Task,
        _assets: Vec<AssetUpload>,
    ) -> Result<(), RegistryClientError> {
        Ok(())
    }

    async fn completed_task_ids(
        &self,
        _build_id: &str,
    ) -> Result<HashSet<String>, RegistryClientError> {
        Ok(self.resume_completed.lock().unwrap().clone())
    }
}

/// Lock manager double with the service's semantics on a process-local map.
struct MemLockManager {
    owner: String,
    locks: Arc<Mutex<HashMap<String, String>>>,
    completed: Arc<Mutex<HashSet<String>>>,
}

impl MemLockManager {
    fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            locks: Arc::new(Mutex::new(HashMap::new())),
            completed: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl LockManager for MemLockManager {
    async fn acquire(
        &self,
        name: &str,
        check_task_completion: bool,
    ) -> Result<LockAttempt, RegistryClientError> {
        if check_task_completion && self.completed.lock().unwrap().contains(name) {
            return Ok(LockAttempt::AlreadyCompleted);
        }
        let mut locks = self.locks.lock().unwrap();
        match locks.get(name) {
            Some(owner) if owner != &self.owner => Ok(LockAttempt::HeldByOther),
            _ => {
                locks.insert(name.to_string(), self.owner.clone());
                Ok(LockAttempt::Acquired)
            }
        }
    }

    async fn renew(&self, name: &str) -> Result<bool, RegistryClientError> {
        Ok(self.locks.lock().unwrap().get(name) == Some(&self.owner))
    }

    async fn release(
        &self,
        name: &str,
        completed_build_id: Option<&str>,
    ) -> Result<bool, RegistryClientError> {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(name) != Some(&self.owner) {
            return Ok(false);
        }
        locks.remove(name);
        if completed_build_id.is_some() {
            self.completed.lock().unwrap().insert(name.to_string());
        }
        Ok(true)
    }

    fn ttl_seconds(&self) -> u64 {
        60
    }
}

enum Behavior {
    Succeed,
    Fail(&'static str),
    /// Yield this batch once, then finish on the next phase.
    DynamicOnce(Vec<TaskRef>),
}

struct TestTask {
    label: String,
    deps: Vec<TaskRef>,
    done: AtomicBool,
    ran: Arc<Mutex<Vec<String>>>,
    behavior: Behavior,
}

impl TestTask {
    fn new(label: &str, deps: Vec<TaskRef>, ran: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            deps,
            done: AtomicBool::new(false),
            ran,
            behavior: Behavior::Succeed,
        })
    }

    fn failing(label: &str, ran: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            deps: Vec::new(),
            done: AtomicBool::new(false),
            ran,
            behavior: Behavior::Fail("intentional test failure"),
        })
    }

    fn dynamic(label: &str, batch: Vec<TaskRef>, ran: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            deps: Vec::new(),
            done: AtomicBool::new(false),
            ran,
            behavior: Behavior::DynamicOnce(batch),
        })
    }

    fn precompleted(label: &str, ran: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        let task = Self::new(label, Vec::new(), ran);
        task.done.store(true, Ordering::SeqCst);
        task
    }
}

#[async_trait]
impl Task for TestTask {
    fn namespace(&self) -> String {
        "tests.engine".to_string()
    }

    fn name(&self) -> String {
        self.label.clone()
    }

    fn params(&self) -> Value {
        json!({ "label": self.label })
    }

    fn requires(&self) -> Vec<TaskRef> {
        self.deps.clone()
    }

    async fn complete(&self) -> Result<bool, TaskError> {
        Ok(self.done.load(Ordering::SeqCst))
    }

    async fn run(&self, phase: usize) -> Result<RunOutcome, TaskError> {
        match &self.behavior {
            Behavior::Succeed => {
                self.ran.lock().unwrap().push(self.label.clone());
                self.done.store(true, Ordering::SeqCst);
                Ok(RunOutcome::Finished)
            }
            Behavior::Fail(message) => Err(TaskError::execution(*message)),
            Behavior::DynamicOnce(batch) => {
                if phase == 0 {
                    self.ran.lock().unwrap().push(format!("{}#yield", self.label));
                    Ok(RunOutcome::Deps(batch.clone()))
                } else {
                    // The contract: every yielded task is complete here.
                    for dep in batch {
                        assert!(dep.complete().await.unwrap(), "yielded dep incomplete");
                    }
                    self.ran.lock().unwrap().push(format!("{}#resume", self.label));
                    self.done.store(true, Ordering::SeqCst);
                    Ok(RunOutcome::Finished)
                }
            }
        }
    }
}

fn run_log() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test]
async fn sequential_respects_dependency_order() {
    let ran = run_log();
    let a = TestTask::new("A", vec![], ran.clone());
    let b = TestTask::new("B", vec![a.clone() as TaskRef], ran.clone());
    let c = TestTask::new("C", vec![a.clone() as TaskRef], ran.clone());
    let d = TestTask::new(
        "D",
        vec![b.clone() as TaskRef, c.clone() as TaskRef],
        ran.clone(),
    );

    let registry = Arc::new(MemRegistry::default());
    let summary = build_sequential(vec![d as TaskRef], registry.clone()).await;

    assert_eq!(summary.status, BuildExitStatus::Success);
    assert_eq!(summary.task_count.discovered, 4);
    assert_eq!(summary.task_count.succeeded, 4);

    let order = ran.lock().unwrap().clone();
    let position = |label: &str| order.iter().position(|l| l == label).unwrap();
    assert!(position("A") < position("B"));
    assert!(position("A") < position("C"));
    assert!(position("B") < position("D"));
    assert!(position("C") < position("D"));

    let events = registry.events();
    assert!(events.contains(&Recorded::BuildStart));
    assert_eq!(*events.last().unwrap(), Recorded::BuildComplete);
    // Upstream registrations land before their dependents'.
    let registrations = registry.names_for(|e| match e {
        Recorded::Register(name) => Some(name.clone()),
        _ => None,
    });
    assert_eq!(registrations.len(), 4);
    assert_eq!(registrations[0], "A");
    assert_eq!(registrations[3], "D");
}

#[tokio::test]
async fn fail_fast_stops_new_work_and_reports_failure() {
    let ran = run_log();
    let bad = TestTask::failing("Bad", ran.clone());
    let dependent = TestTask::new("Dependent", vec![bad.clone() as TaskRef], ran.clone());

    let registry = Arc::new(MemRegistry::default());
    let summary = build_sequential(vec![dependent as TaskRef], registry.clone()).await;

    assert_eq!(summary.status, BuildExitStatus::Failure);
    assert_eq!(summary.task_count.failed, 1);
    assert!(summary.error.as_deref().unwrap().contains("intentional"));
    assert!(ran.lock().unwrap().is_empty(), "dependent must not run");

    let events = registry.events();
    assert!(matches!(events.last(), Some(Recorded::BuildFail(_))));
    assert!(events.contains(&Recorded::Fail("Bad".to_string())));
}

#[tokio::test]
async fn fail_at_end_lets_other_branches_finish() {
    let ran = run_log();
    let bad = TestTask::failing("Bad", ran.clone());
    let bad_child = TestTask::new("BadChild", vec![bad.clone() as TaskRef], ran.clone());
    let good = TestTask::new("Good", vec![], ran.clone());
    let good_child = TestTask::new("GoodChild", vec![good.clone() as TaskRef], ran.clone());

    let registry = Arc::new(MemRegistry::default());
    let summary = build(
        vec![bad_child as TaskRef, good_child as TaskRef],
        registry.clone(),
        None,
        BuildConfig {
            fail_mode: FailMode::FailAtEnd,
            ..BuildConfig::default()
        },
    )
    .await;

    assert_eq!(summary.status, BuildExitStatus::Failure);
    assert_eq!(summary.task_count.failed, 1);
    assert_eq!(summary.task_count.succeeded, 2);

    let order = ran.lock().unwrap().clone();
    assert!(order.contains(&"Good".to_string()));
    assert!(order.contains(&"GoodChild".to_string()));
    assert!(!order.contains(&"BadChild".to_string()));
}

#[tokio::test]
async fn dynamic_dependencies_complete_before_resume() {
    let ran = run_log();
    let x = TestTask::new("X", vec![], ran.clone());
    let y = TestTask::new("Y", vec![], ran.clone());
    let parent = TestTask::dynamic(
        "Parent",
        vec![x.clone() as TaskRef, y.clone() as TaskRef],
        ran.clone(),
    );

    let registry = Arc::new(MemRegistry::default());
    let summary = build_sequential(vec![parent as TaskRef], registry.clone()).await;

    assert_eq!(summary.status, BuildExitStatus::Success);
    // Parent + 2 dynamic deps.
    assert_eq!(summary.task_count.discovered, 3);
    assert_eq!(summary.task_count.succeeded, 3);

    let order = ran.lock().unwrap().clone();
    let position = |label: &str| order.iter().position(|l| l == label).unwrap();
    assert!(position("Parent#yield") < position("X"));
    assert!(position("X") < position("Parent#resume"));
    assert!(position("Y") < position("Parent#resume"));
}

#[tokio::test]
async fn already_complete_subtrees_are_not_descended() {
    let ran = run_log();
    let hidden = TestTask::failing("Hidden", ran.clone());
    let done = Arc::new(TestTask {
        label: "Done".to_string(),
        deps: vec![hidden as TaskRef],
        done: AtomicBool::new(true),
        ran: ran.clone(),
        behavior: Behavior::Succeed,
    });
    let top = TestTask::new("Top", vec![done as TaskRef], ran.clone());

    let registry = Arc::new(MemRegistry::default());
    let summary = build_sequential(vec![top as TaskRef], registry.clone()).await;

    assert_eq!(summary.status, BuildExitStatus::Success);
    // Hidden is never discovered: only Top and Done.
    assert_eq!(summary.task_count.discovered, 2);
    assert_eq!(summary.task_count.previously_completed, 1);
    assert_eq!(ran.lock().unwrap().clone(), vec!["Top".to_string()]);
}

#[tokio::test]
async fn cooperative_mode_builds_the_same_graph() {
    let ran = run_log();
    let a = TestTask::new("A", vec![], ran.clone());
    let b = TestTask::new("B", vec![], ran.clone());
    let c = TestTask::new(
        "C",
        vec![a.clone() as TaskRef, b.clone() as TaskRef],
        ran.clone(),
    );

    let registry = Arc::new(MemRegistry::default());
    let summary = build(
        vec![c as TaskRef],
        registry.clone(),
        None,
        BuildConfig {
            concurrency: Concurrency::Cooperative { max_in_flight: 4 },
            ..BuildConfig::default()
        },
    )
    .await;

    assert_eq!(summary.status, BuildExitStatus::Success);
    assert_eq!(summary.task_count.succeeded, 3);
    assert_eq!(ran.lock().unwrap().last().unwrap(), "C");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_mode_builds_a_wide_graph() {
    let ran = run_log();
    let leaves: Vec<TaskRef> = (0..8)
        .map(|i| TestTask::new(&format!("Leaf{i}"), vec![], ran.clone()) as TaskRef)
        .collect();
    let root = TestTask::new("Root", leaves.clone(), ran.clone());

    let registry = Arc::new(MemRegistry::default());
    let summary = build_parallel(vec![root as TaskRef], registry.clone(), 4).await;

    assert_eq!(summary.status, BuildExitStatus::Success);
    assert_eq!(summary.task_count.succeeded, 9);
    let order = ran.lock().unwrap().clone();
    assert_eq!(order.last().unwrap(), "Root");
}

fn locked_config(concurrency: Concurrency) -> BuildConfig {
    BuildConfig {
        concurrency,
        lock: GlobalLockConfig {
            enabled: true,
            ttl_seconds: 60,
            wait_timeout: None,
            wait_initial_interval: Duration::from_millis(10),
            wait_max_interval: Duration::from_millis(50),
            wait_backoff_factor: 2.0,
        },
        ..BuildConfig::default()
    }
}

#[tokio::test]
async fn locked_build_releases_with_completion() {
    let ran = run_log();
    let a = TestTask::new("A", vec![], ran.clone());
    let b = TestTask::new("B", vec![a.clone() as TaskRef], ran.clone());

    let registry = Arc::new(MemRegistry::default());
    let locks = Arc::new(MemLockManager::new("proc-1"));
    let summary = build(
        vec![b.clone() as TaskRef],
        registry.clone(),
        Some(locks.clone()),
        locked_config(Concurrency::Sequential),
    )
    .await;

    assert_eq!(summary.status, BuildExitStatus::Success);
    // Completion was recorded through release-with-completion, not a
    // separate complete call.
    let completes = registry.names_for(|e| match e {
        Recorded::Complete(name) => Some(name.clone()),
        _ => None,
    });
    assert!(completes.is_empty());
    assert!(locks.locks.lock().unwrap().is_empty(), "all locks released");
    let completed = locks.completed.lock().unwrap().clone();
    assert!(completed.contains(&a.id()));
    assert!(completed.contains(&b.id()));
}

#[tokio::test]
async fn lock_already_completed_skips_execution() {
    let ran = run_log();
    let task = TestTask::new("Shared", vec![], ran.clone());

    let registry = Arc::new(MemRegistry::default());
    let locks = Arc::new(MemLockManager::new("proc-2"));
    locks.completed.lock().unwrap().insert(task.id());

    let summary = build(
        vec![task.clone() as TaskRef],
        registry.clone(),
        Some(locks),
        locked_config(Concurrency::Sequential),
    )
    .await;

    assert_eq!(summary.status, BuildExitStatus::Success);
    assert_eq!(summary.task_count.previously_completed, 1);
    assert_eq!(summary.task_count.succeeded, 0);
    assert!(ran.lock().unwrap().is_empty());
}

#[tokio::test]
async fn lock_held_elsewhere_without_retry_fails_the_task() {
    let ran = run_log();
    let task = TestTask::new("Contended", vec![], ran.clone());

    let registry = Arc::new(MemRegistry::default());
    let locks = Arc::new(MemLockManager::new("proc-3"));
    locks
        .locks
        .lock()
        .unwrap()
        .insert(task.id(), "someone-else".to_string());

    let summary = build(
        vec![task as TaskRef],
        registry.clone(),
        Some(locks),
        locked_config(Concurrency::Sequential),
    )
    .await;

    assert_eq!(summary.status, BuildExitStatus::Failure);
    assert!(summary.error.as_deref().unwrap().contains("lock"));
    assert!(ran.lock().unwrap().is_empty());
}

#[tokio::test]
async fn resume_skips_tasks_completed_in_the_build() {
    let ran = run_log();
    let a = TestTask::new("A", vec![], ran.clone());
    let b = TestTask::new("B", vec![a.clone() as TaskRef], ran.clone());

    let registry = Arc::new(MemRegistry::default());
    registry.resume_completed.lock().unwrap().insert(a.id());

    let summary = build(
        vec![b as TaskRef],
        registry.clone(),
        None,
        BuildConfig {
            resume_build_id: Some("build-1".to_string()),
            ..BuildConfig::default()
        },
    )
    .await;

    assert_eq!(summary.status, BuildExitStatus::Success);
    assert_eq!(summary.build_id.as_deref(), Some("build-1"));
    assert_eq!(summary.task_count.previously_completed, 1);
    assert_eq!(ran.lock().unwrap().clone(), vec!["B".to_string()]);
    // No new build was created on the registry.
    assert!(!registry.events().contains(&Recorded::BuildStart));
}

#[tokio::test]
async fn previously_completed_task_is_skipped_entirely() {
    let ran = run_log();
    let done = TestTask::precompleted("AlreadyDone", ran.clone());
    let registry = Arc::new(MemRegistry::default());
    let summary = build_sequential(vec![done as TaskRef], registry.clone()).await;

    assert_eq!(summary.status, BuildExitStatus::Success);
    assert_eq!(summary.task_count.previously_completed, 1);
    assert_eq!(summary.task_count.succeeded, 0);
    assert!(ran.lock().unwrap().is_empty());
    // Still registered so it appears in the build's task list.
    assert!(registry
        .events()
        .contains(&Recorded::Register("AlreadyDone".to_string())));
}
