use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAcquireStatus {
    Acquired,
    AlreadyCompleted,
    HeldByOther,
    ConcurrencyLimitReached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockAcquireRequest {
    pub owner_id: String,
    pub ttl_seconds: u64,
    #[serde(default = "default_check_completion")]
    pub check_task_completion: bool,
}

fn default_check_completion() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRenewRequest {
    pub owner_id: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockReleaseRequest {
    pub owner_id: String,
    /// When set, a TASK_COMPLETED event is appended for this build in the
    /// same transaction as the lock delete.
    #[serde(default)]
    pub completed_build_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub name: String,
    pub environment_id: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockAcquireResponse {
    pub status: LockAcquireStatus,
    pub acquired: bool,
    pub lock: Option<LockResponse>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockListResponse {
    pub locks: Vec<LockResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockCompletionStatusResponse {
    pub is_completed: bool,
}
