//! The global-lock seam and its retry configuration.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RegistryClientError;

/// Outcome of a single acquisition attempt, mirroring the service contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    AlreadyCompleted,
    HeldByOther,
    ConcurrencyLimitReached,
}

/// Lease operations against the lock service. The owner id and TTL are
/// fixed per manager instance: one fresh UUID per build process, reused for
/// every acquire so retries are re-entrant.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(
        &self,
        name: &str,
        check_task_completion: bool,
    ) -> Result<LockAttempt, RegistryClientError>;

    async fn renew(&self, name: &str) -> Result<bool, RegistryClientError>;

    /// Release the lock; with `completed_build_id` the TASK_COMPLETED event
    /// and the unlock commit in one registry transaction.
    async fn release(
        &self,
        name: &str,
        completed_build_id: Option<&str>,
    ) -> Result<bool, RegistryClientError>;

    fn ttl_seconds(&self) -> u64;
}

/// Engine-side lock behavior knobs.
#[derive(Debug, Clone)]
pub struct GlobalLockConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    /// How long to keep retrying a refused acquire; None retries are not
    /// attempted (a single refusal is final).
    pub wait_timeout: Option<Duration>,
    pub wait_initial_interval: Duration,
    pub wait_max_interval: Duration,
    pub wait_backoff_factor: f64,
}

impl Default for GlobalLockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: 300,
            wait_timeout: Some(Duration::from_secs(600)),
            wait_initial_interval: Duration::from_secs(1),
            wait_max_interval: Duration::from_secs(30),
            wait_backoff_factor: 2.0,
        }
    }
}

impl GlobalLockConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn next_interval(&self, current: Duration) -> Duration {
        let scaled = current.as_secs_f64() * self.wait_backoff_factor;
        Duration::from_secs_f64(scaled.min(self.wait_max_interval.as_secs_f64()))
    }
}
