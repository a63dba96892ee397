//! redb database handle and table definitions.
//!
//! Every entity lives in its own table keyed by id; secondary index tables
//! with composite string keys provide the ordered scans the API relies on.
//! Composite keys join segments with `/`; prefix scans use the range
//! `"<prefix>/".."<prefix>0"` ('0' is the code point after '/').

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};

use crate::error::RegistryError;

pub type DbHandle = Arc<Database>;

// Entity tables: id -> bincode row.
pub const ORGANIZATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("organizations");
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
pub const MEMBERSHIPS: TableDefinition<&str, &[u8]> = TableDefinition::new("memberships");
pub const INVITES: TableDefinition<&str, &[u8]> = TableDefinition::new("invites");
pub const WORKSPACES: TableDefinition<&str, &[u8]> = TableDefinition::new("workspaces");
pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");
pub const API_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_keys");
pub const TARGET_ROOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("target_roots");
pub const BUILDS: TableDefinition<&str, &[u8]> = TableDefinition::new("builds");
pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("distributed_locks");
pub const ASSETS: TableDefinition<&str, &[u8]> = TableDefinition::new("task_registry_assets");

// Index tables.
pub const ORG_SLUGS: TableDefinition<&str, &str> = TableDefinition::new("idx_org_slugs");
pub const USERS_BY_EXTERNAL: TableDefinition<&str, &str> =
    TableDefinition::new("idx_users_by_external_id");
pub const USERS_BY_EMAIL: TableDefinition<&str, &str> = TableDefinition::new("idx_users_by_email");
// (organization_id, email) -> invite id, present only while the invite is pending.
pub const PENDING_INVITES: TableDefinition<&str, &str> =
    TableDefinition::new("idx_pending_invites");
pub const WORKSPACE_SLUGS: TableDefinition<&str, &str> =
    TableDefinition::new("idx_workspace_slugs");
pub const ENVIRONMENT_SLUGS: TableDefinition<&str, &str> =
    TableDefinition::new("idx_environment_slugs");
// (key_prefix, id) -> id; prefixes are not unique.
pub const API_KEYS_BY_PREFIX: TableDefinition<&str, &str> =
    TableDefinition::new("idx_api_keys_by_prefix");
// (environment_id, created_at, build_id) -> build_id.
pub const BUILDS_BY_ENV: TableDefinition<&str, &str> = TableDefinition::new("idx_builds_by_env");
// (environment_id, task_id) -> task pk; the dedup invariant.
pub const TASKS_BY_TASK_ID: TableDefinition<&str, u64> =
    TableDefinition::new("idx_tasks_by_task_id");
// (environment_id, created_at, pk) -> pk.
pub const TASKS_BY_ENV: TableDefinition<&str, u64> = TableDefinition::new("idx_tasks_by_env");
// (upstream pk, downstream pk) and the reverse direction.
pub const TASK_DEPS_DOWN: TableDefinition<&str, ()> = TableDefinition::new("idx_task_deps_down");
pub const TASK_DEPS_UP: TableDefinition<&str, ()> = TableDefinition::new("idx_task_deps_up");
// (task pk, event seq) -> bincode event row (same row as in EVENTS).
pub const EVENTS_BY_TASK: TableDefinition<&str, &[u8]> =
    TableDefinition::new("idx_events_by_task");
// (environment_id, lock name) -> lock name.
pub const LOCKS_BY_ENV: TableDefinition<&str, &str> = TableDefinition::new("idx_locks_by_env");

// Monotonic counters: task pk sequence, event sequence.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const META_TASK_PK_SEQ: &str = "task_pk_seq";
pub const META_EVENT_SEQ: &str = "event_seq";

/// Open (or create) the registry database and make sure all tables exist so
/// read transactions never race table creation.
pub fn open_db(path: &Path) -> Result<DbHandle, RegistryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RegistryError::Internal(format!("create db directory: {e}")))?;
        }
    }

    let db = Database::create(path)?;

    let write_txn = db.begin_write()?;
    {
        write_txn.open_table(ORGANIZATIONS)?;
        write_txn.open_table(USERS)?;
        write_txn.open_table(MEMBERSHIPS)?;
        write_txn.open_table(INVITES)?;
        write_txn.open_table(WORKSPACES)?;
        write_txn.open_table(ENVIRONMENTS)?;
        write_txn.open_table(API_KEYS)?;
        write_txn.open_table(TARGET_ROOTS)?;
        write_txn.open_table(BUILDS)?;
        write_txn.open_table(TASKS)?;
        write_txn.open_table(EVENTS)?;
        write_txn.open_table(LOCKS)?;
        write_txn.open_table(ASSETS)?;
        write_txn.open_table(ORG_SLUGS)?;
        write_txn.open_table(USERS_BY_EXTERNAL)?;
        write_txn.open_table(USERS_BY_EMAIL)?;
        write_txn.open_table(PENDING_INVITES)?;
        write_txn.open_table(WORKSPACE_SLUGS)?;
        write_txn.open_table(ENVIRONMENT_SLUGS)?;
        write_txn.open_table(API_KEYS_BY_PREFIX)?;
        write_txn.open_table(BUILDS_BY_ENV)?;
        write_txn.open_table(TASKS_BY_TASK_ID)?;
        write_txn.open_table(TASKS_BY_ENV)?;
        write_txn.open_table(TASK_DEPS_DOWN)?;
        write_txn.open_table(TASK_DEPS_UP)?;
        write_txn.open_table(EVENTS_BY_TASK)?;
        write_txn.open_table(LOCKS_BY_ENV)?;
        write_txn.open_table(META)?;
    }
    write_txn.commit()?;

    Ok(Arc::new(db))
}

/// Join key segments with `/`.
pub fn key2(a: &str, b: &str) -> String {
    format!("{a}/{b}")
}

pub fn key3(a: &str, b: &str, c: &str) -> String {
    format!("{a}/{b}/{c}")
}

/// Zero-padded fixed-width rendering so lexicographic order matches numeric
/// order inside composite keys.
pub fn padded(n: u64) -> String {
    format!("{n:020}")
}

/// Range bounds covering every key that starts with `prefix + "/"`.
pub fn prefix_range(prefix: &str) -> (String, String) {
    (format!("{prefix}/"), format!("{prefix}0"))
}
