//! Lease-based distributed locks, scoped to an environment and keyed by
//! lock name (by convention a task content hash).
//!
//! Every operation is one redb write transaction. redb serializes writers,
//! so the conditional upsert in `acquire_lock` is linearizable per name:
//! two concurrent acquires cannot both observe an expired or absent row.

use chrono::{DateTime, Duration, Utc};
use redb::ReadableTable;

use stardag_types::{EventType, LockAcquireStatus};

use crate::db;
use crate::error::RegistryError;
use crate::store::rows::LockRow;
use crate::store::{append_event_tx, decode, encode, events_of_task, Store};

#[derive(Debug, Clone)]
pub struct LockAcquisition {
    pub status: LockAcquireStatus,
    pub lock: Option<LockRow>,
    pub error_message: Option<String>,
}

impl LockAcquisition {
    pub fn acquired(&self) -> bool {
        self.status == LockAcquireStatus::Acquired
    }

    fn refused(status: LockAcquireStatus, error_message: Option<String>) -> Self {
        Self {
            status,
            lock: None,
            error_message,
        }
    }
}

impl Store {
    /// True if the task named by `task_hash` has at least one
    /// TASK_COMPLETED event in any build of the environment.
    pub fn task_completed_in_registry(
        &self,
        env_id: &str,
        task_hash: &str,
    ) -> Result<bool, RegistryError> {
        let txn = self.db().begin_read()?;
        let tasks_by_task_id = txn.open_table(db::TASKS_BY_TASK_ID)?;
        let Some(pk) = tasks_by_task_id
            .get(db::key2(env_id, task_hash).as_str())?
            .map(|g| g.value())
        else {
            // Not registered in this environment, so not completed.
            return Ok(false);
        };
        let events_by_task = txn.open_table(db::EVENTS_BY_TASK)?;
        let events = events_of_task(&events_by_task, pk)?;
        Ok(events
            .iter()
            .any(|e| e.event_type == EventType::TaskCompleted))
    }

    /// Attempt to acquire a lock. The lock is granted when no row exists,
    /// the existing row has expired, or the caller already owns it
    /// (re-entrant, extending the TTL and bumping `version`).
    pub fn acquire_lock(
        &self,
        name: &str,
        owner_id: &str,
        env_id: &str,
        ttl_seconds: u64,
        check_task_completion: bool,
    ) -> Result<LockAcquisition, RegistryError> {
        let env = self.get_environment(env_id)?;

        if check_task_completion && self.task_completed_in_registry(env_id, name)? {
            return Ok(LockAcquisition::refused(
                LockAcquireStatus::AlreadyCompleted,
                None,
            ));
        }

        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_seconds as i64);

        let txn = self.db().begin_write()?;
        let result = {
            let mut locks = txn.open_table(db::LOCKS)?;
            let mut locks_by_env = txn.open_table(db::LOCKS_BY_ENV)?;

            let existing: Option<LockRow> = match locks.get(name)? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };

            let caller_holds = existing
                .as_ref()
                .map(|lock| lock.owner_id == owner_id)
                .unwrap_or(false);

            // The concurrency cap only gates acquisitions that would add a
            // lock the caller does not already hold.
            if let Some(cap) = env.max_concurrent_locks {
                if !caller_holds {
                    let active = count_active_locks(&locks, &locks_by_env, env_id, now)?;
                    if active >= cap as usize {
                        let message = format!("Environment concurrency limit reached ({cap})");
                        return Ok(LockAcquisition::refused(
                            LockAcquireStatus::ConcurrencyLimitReached,
                            Some(message),
                        ));
                    }
                }
            }

            match existing {
                Some(lock) if lock.is_active(now) && lock.owner_id != owner_id => {
                    LockAcquisition::refused(
                        LockAcquireStatus::HeldByOther,
                        Some("Lock is held by another owner".to_string()),
                    )
                }
                Some(lock) => {
                    // Expired takeover or re-entrant reacquire.
                    let updated = LockRow {
                        name: name.to_string(),
                        environment_id: env_id.to_string(),
                        owner_id: owner_id.to_string(),
                        acquired_at: now,
                        expires_at,
                        version: lock.version + 1,
                    };
                    if lock.environment_id != env_id {
                        locks_by_env.remove(db::key2(&lock.environment_id, name).as_str())?;
                    }
                    locks.insert(name, encode(&updated)?.as_slice())?;
                    locks_by_env.insert(db::key2(env_id, name).as_str(), name)?;
                    LockAcquisition {
                        status: LockAcquireStatus::Acquired,
                        lock: Some(updated),
                        error_message: None,
                    }
                }
                None => {
                    let created = LockRow {
                        name: name.to_string(),
                        environment_id: env_id.to_string(),
                        owner_id: owner_id.to_string(),
                        acquired_at: now,
                        expires_at,
                        version: 0,
                    };
                    locks.insert(name, encode(&created)?.as_slice())?;
                    locks_by_env.insert(db::key2(env_id, name).as_str(), name)?;
                    LockAcquisition {
                        status: LockAcquireStatus::Acquired,
                        lock: Some(created),
                        error_message: None,
                    }
                }
            }
        };
        txn.commit()?;
        Ok(result)
    }

    /// Extend a lock's lease. Fails unless the caller owns the lock.
    pub fn renew_lock(
        &self,
        name: &str,
        owner_id: &str,
        ttl_seconds: u64,
    ) -> Result<Option<LockRow>, RegistryError> {
        let now = Utc::now();
        let txn = self.db().begin_write()?;
        let renewed = {
            let mut locks = txn.open_table(db::LOCKS)?;
            let existing: Option<LockRow> = match locks.get(name)? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match existing {
                Some(mut lock) if lock.owner_id == owner_id => {
                    lock.expires_at = now + Duration::seconds(ttl_seconds as i64);
                    lock.version += 1;
                    locks.insert(name, encode(&lock)?.as_slice())?;
                    Some(lock)
                }
                _ => None,
            }
        };
        txn.commit()?;
        Ok(renewed)
    }

    /// Delete a lock if the caller owns it. Returns whether a row was removed.
    pub fn release_lock(&self, name: &str, owner_id: &str) -> Result<bool, RegistryError> {
        let txn = self.db().begin_write()?;
        let released = {
            let mut locks = txn.open_table(db::LOCKS)?;
            let existing: Option<LockRow> = match locks.get(name)? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match existing {
                Some(lock) if lock.owner_id == owner_id => {
                    locks.remove(name)?;
                    let mut locks_by_env = txn.open_table(db::LOCKS_BY_ENV)?;
                    locks_by_env.remove(db::key2(&lock.environment_id, name).as_str())?;
                    true
                }
                _ => false,
            }
        };
        txn.commit()?;
        Ok(released)
    }

    /// Record task completion and release the lock atomically, closing the
    /// window where another process could observe "released but not yet
    /// completed". The transaction is abandoned if the caller is not the
    /// owner, so no stray completion event is recorded.
    pub fn release_lock_with_completion(
        &self,
        name: &str,
        owner_id: &str,
        env_id: &str,
        build_id: &str,
    ) -> Result<bool, RegistryError> {
        let txn = self.db().begin_write()?;
        let released = {
            let mut locks = txn.open_table(db::LOCKS)?;
            let existing: Option<LockRow> = match locks.get(name)? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let Some(lock) = existing.filter(|lock| lock.owner_id == owner_id) else {
                return Ok(false);
            };

            let tasks_by_task_id = txn.open_table(db::TASKS_BY_TASK_ID)?;
            let task_pk = tasks_by_task_id
                .get(db::key2(env_id, name).as_str())?
                .map(|g| g.value());

            if let Some(pk) = task_pk {
                let mut events = txn.open_table(db::EVENTS)?;
                let mut events_by_task = txn.open_table(db::EVENTS_BY_TASK)?;
                let mut meta = txn.open_table(db::META)?;
                append_event_tx(
                    &mut events,
                    &mut events_by_task,
                    &mut meta,
                    build_id,
                    Some(pk),
                    EventType::TaskCompleted,
                    None,
                    None,
                )?;
            }

            locks.remove(name)?;
            let mut locks_by_env = txn.open_table(db::LOCKS_BY_ENV)?;
            locks_by_env.remove(db::key2(&lock.environment_id, name).as_str())?;
            true
        };
        txn.commit()?;
        Ok(released)
    }

    pub fn get_lock(&self, name: &str) -> Result<Option<LockRow>, RegistryError> {
        let txn = self.db().begin_read()?;
        let locks = txn.open_table(db::LOCKS)?;
        let result = match locks.get(name)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        };
        result
    }

    pub fn list_locks(
        &self,
        env_id: &str,
        include_expired: bool,
    ) -> Result<Vec<LockRow>, RegistryError> {
        let now = Utc::now();
        let txn = self.db().begin_read()?;
        let locks = txn.open_table(db::LOCKS)?;
        let locks_by_env = txn.open_table(db::LOCKS_BY_ENV)?;

        let (start, end) = db::prefix_range(env_id);
        let mut out = Vec::new();
        for item in locks_by_env.range(start.as_str()..end.as_str())? {
            let (_, name) = item?;
            let Some(guard) = locks.get(name.value())? else { continue };
            let lock: LockRow = decode(guard.value())?;
            if include_expired || lock.is_active(now) {
                out.push(lock);
            }
        }
        out.sort_by(|a, b| b.acquired_at.cmp(&a.acquired_at));
        Ok(out)
    }

    /// Periodic sweep of expired rows. Correctness never depends on this:
    /// any later acquire with the same name silently takes over.
    pub fn cleanup_expired_locks(
        &self,
        env_id: Option<&str>,
    ) -> Result<usize, RegistryError> {
        let now = Utc::now();
        let txn = self.db().begin_write()?;
        let deleted = {
            let mut locks = txn.open_table(db::LOCKS)?;
            let expired: Vec<LockRow> = {
                let mut expired = Vec::new();
                for item in locks.iter()? {
                    let (_, value) = item?;
                    let lock: LockRow = decode(value.value())?;
                    if lock.is_active(now) {
                        continue;
                    }
                    if env_id.map(|e| e == lock.environment_id).unwrap_or(true) {
                        expired.push(lock);
                    }
                }
                expired
            };
            let mut locks_by_env = txn.open_table(db::LOCKS_BY_ENV)?;
            let count = expired.len();
            for lock in expired {
                locks.remove(lock.name.as_str())?;
                locks_by_env.remove(db::key2(&lock.environment_id, &lock.name).as_str())?;
            }
            count
        };
        txn.commit()?;
        Ok(deleted)
    }
}

fn count_active_locks(
    locks: &impl ReadableTable<&'static str, &'static [u8]>,
    locks_by_env: &impl ReadableTable<&'static str, &'static str>,
    env_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, RegistryError> {
    let (start, end) = db::prefix_range(env_id);
    let mut count = 0;
    for item in locks_by_env.range(start.as_str()..end.as_str())? {
        let (_, name) = item?;
        let Some(guard) = locks.get(name.value())? else { continue };
        let lock: LockRow = decode(guard.value())?;
        if lock.is_active(now) {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::orgs::{DEFAULT_ENVIRONMENT_ID, DEFAULT_WORKSPACE_ID};
    use stardag_types::{CreateBuildRequest, CreateEnvironmentRequest, RegisterTaskRequest};
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("registry.redb")).unwrap();
        (dir, store)
    }

    fn capped_env(store: &Store, cap: u32) -> String {
        store
            .create_environment(
                DEFAULT_WORKSPACE_ID,
                &CreateEnvironmentRequest {
                    name: format!("capped-{cap}"),
                    slug: format!("capped-{cap}"),
                    description: None,
                    owner_user_id: None,
                    max_concurrent_locks: Some(cap),
                },
            )
            .unwrap()
            .id
    }

    #[test]
    fn acquire_then_contention_then_takeover() {
        let (_dir, store) = test_store();
        let env = DEFAULT_ENVIRONMENT_ID;

        let first = store.acquire_lock("task-a", "owner-1", env, 60, true).unwrap();
        assert_eq!(first.status, LockAcquireStatus::Acquired);
        assert_eq!(first.lock.as_ref().unwrap().version, 0);

        let second = store.acquire_lock("task-a", "owner-2", env, 60, true).unwrap();
        assert_eq!(second.status, LockAcquireStatus::HeldByOther);
        assert!(second.lock.is_none());

        // Force expiry, then the other owner takes over.
        {
            let lock = store.get_lock("task-a").unwrap().unwrap();
            let expired = LockRow {
                expires_at: Utc::now() - Duration::seconds(1),
                ..lock
            };
            let txn = store.db().begin_write().unwrap();
            {
                let mut locks = txn.open_table(db::LOCKS).unwrap();
                locks
                    .insert("task-a", encode(&expired).unwrap().as_slice())
                    .unwrap();
            }
            txn.commit().unwrap();
        }

        let takeover = store.acquire_lock("task-a", "owner-2", env, 60, true).unwrap();
        assert_eq!(takeover.status, LockAcquireStatus::Acquired);
        assert_eq!(takeover.lock.unwrap().owner_id, "owner-2");
    }

    #[test]
    fn reentrant_acquire_extends_and_bumps_version() {
        let (_dir, store) = test_store();
        let env = DEFAULT_ENVIRONMENT_ID;

        let first = store.acquire_lock("task-b", "owner-1", env, 60, false).unwrap();
        let second = store.acquire_lock("task-b", "owner-1", env, 60, false).unwrap();
        assert_eq!(second.status, LockAcquireStatus::Acquired);
        assert_eq!(
            second.lock.as_ref().unwrap().version,
            first.lock.as_ref().unwrap().version + 1
        );
    }

    #[test]
    fn lock_expiring_exactly_now_is_expired() {
        let now = Utc::now();
        let lock = LockRow {
            name: "n".to_string(),
            environment_id: "e".to_string(),
            owner_id: "o".to_string(),
            acquired_at: now,
            expires_at: now,
            version: 0,
        };
        assert!(!lock.is_active(now));
    }

    #[test]
    fn concurrency_cap_counts_only_foreign_active_locks() {
        let (_dir, store) = test_store();
        let env = capped_env(&store, 2);

        assert!(store.acquire_lock("l1", "u1", &env, 60, false).unwrap().acquired());
        assert!(store.acquire_lock("l2", "u2", &env, 60, false).unwrap().acquired());

        let third = store.acquire_lock("l3", "u3", &env, 60, false).unwrap();
        assert_eq!(third.status, LockAcquireStatus::ConcurrencyLimitReached);

        // Re-entrant reacquire does not count against the cap.
        let again = store.acquire_lock("l1", "u1", &env, 60, false).unwrap();
        assert_eq!(again.status, LockAcquireStatus::Acquired);
    }

    #[test]
    fn zero_cap_refuses_every_new_lock() {
        let (_dir, store) = test_store();
        let env = capped_env(&store, 0);
        let result = store.acquire_lock("l1", "u1", &env, 60, false).unwrap();
        assert_eq!(result.status, LockAcquireStatus::ConcurrencyLimitReached);
    }

    #[test]
    fn renew_and_release_require_ownership() {
        let (_dir, store) = test_store();
        let env = DEFAULT_ENVIRONMENT_ID;
        store.acquire_lock("task-c", "owner-1", env, 60, false).unwrap();

        assert!(store.renew_lock("task-c", "owner-2", 60).unwrap().is_none());
        let renewed = store.renew_lock("task-c", "owner-1", 120).unwrap().unwrap();
        assert_eq!(renewed.version, 1);

        assert!(!store.release_lock("task-c", "owner-2").unwrap());
        assert!(store.release_lock("task-c", "owner-1").unwrap());
        // Releasing again fails: the row is gone.
        assert!(!store.release_lock("task-c", "owner-1").unwrap());
    }

    #[test]
    fn already_completed_short_circuits_acquire() {
        let (_dir, store) = test_store();
        let env = DEFAULT_ENVIRONMENT_ID;

        let build = store
            .create_build(env, None, &CreateBuildRequest {
                description: None,
                commit_hash: None,
                root_task_ids: vec!["deadbeef".to_string()],
            })
            .unwrap();
        store
            .register_task(&build.id, &RegisterTaskRequest {
                task_id: "deadbeef".to_string(),
                task_namespace: "demo".to_string(),
                task_name: "Leaf".to_string(),
                task_data: serde_json::json!({"x": 1}),
                version: None,
                dependency_task_ids: vec![],
            })
            .unwrap();
        store
            .append_task_event(&build.id, "deadbeef", EventType::TaskCompleted, None)
            .unwrap();

        let result = store
            .acquire_lock("deadbeef", "owner-2", env, 60, true)
            .unwrap();
        assert_eq!(result.status, LockAcquireStatus::AlreadyCompleted);
        assert!(store.get_lock("deadbeef").unwrap().is_none());

        // Without the completion check the lock is still grantable.
        let unchecked = store
            .acquire_lock("deadbeef", "owner-2", env, 60, false)
            .unwrap();
        assert_eq!(unchecked.status, LockAcquireStatus::Acquired);
    }

    #[test]
    fn release_with_completion_appends_event_and_deletes_lock() {
        let (_dir, store) = test_store();
        let env = DEFAULT_ENVIRONMENT_ID;

        let build = store
            .create_build(env, None, &CreateBuildRequest {
                description: None,
                commit_hash: None,
                root_task_ids: vec!["cafe01".to_string()],
            })
            .unwrap();
        store
            .register_task(&build.id, &RegisterTaskRequest {
                task_id: "cafe01".to_string(),
                task_namespace: "demo".to_string(),
                task_name: "Leaf".to_string(),
                task_data: serde_json::json!({}),
                version: None,
                dependency_task_ids: vec![],
            })
            .unwrap();

        store.acquire_lock("cafe01", "owner-1", env, 60, true).unwrap();

        // Wrong owner: nothing happens, no completion is recorded.
        assert!(!store
            .release_lock_with_completion("cafe01", "owner-2", env, &build.id)
            .unwrap());
        assert!(!store.task_completed_in_registry(env, "cafe01").unwrap());

        assert!(store
            .release_lock_with_completion("cafe01", "owner-1", env, &build.id)
            .unwrap());
        assert!(store.get_lock("cafe01").unwrap().is_none());
        assert!(store.task_completed_in_registry(env, "cafe01").unwrap());

        let tasks = store.tasks_in_build(&build.id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[0].1.status(),
            stardag_types::TaskStatus::Completed
        );
    }

    #[test]
    fn cleanup_sweeps_only_expired_locks() {
        let (_dir, store) = test_store();
        let env = DEFAULT_ENVIRONMENT_ID;

        store.acquire_lock("fresh", "u1", env, 600, false).unwrap();
        store.acquire_lock("stale", "u2", env, 600, false).unwrap();
        {
            let lock = store.get_lock("stale").unwrap().unwrap();
            let expired = LockRow {
                expires_at: Utc::now() - Duration::seconds(5),
                ..lock
            };
            let txn = store.db().begin_write().unwrap();
            {
                let mut locks = txn.open_table(db::LOCKS).unwrap();
                locks
                    .insert("stale", encode(&expired).unwrap().as_slice())
                    .unwrap();
            }
            txn.commit().unwrap();
        }

        assert_eq!(store.cleanup_expired_locks(Some(env)).unwrap(), 1);
        assert!(store.get_lock("stale").unwrap().is_none());
        assert!(store.get_lock("fresh").unwrap().is_some());

        let listed = store.list_locks(env, false).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "fresh");
    }
}
