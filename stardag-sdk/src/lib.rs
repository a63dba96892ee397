//! Stardag client SDK: author task DAGs, execute them with the build
//! engine, and report lifecycle events to a central registry.

pub mod build;
pub mod client;
pub mod error;
pub mod lock_manager;
pub mod params;
pub mod registry;
pub mod target;
pub mod task;

pub use build::{
    build, build_parallel, build_sequential, build_with_locks, BuildConfig, BuildExitStatus,
    BuildSummary, Concurrency, FailMode, TaskCount,
};
pub use client::{ApiLockManager, ApiRegistry, ApiRegistryConfig, TokenRefresher};
pub use error::{RegistryClientError, TaskError};
pub use lock_manager::{GlobalLockConfig, LockAttempt, LockManager};
pub use params::{task_id_from_parts, ParamSpec, SerializeMode};
pub use registry::{NoopRegistry, Registry};
pub use task::{RunOutcome, Task, TaskRef};
