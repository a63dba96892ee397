//! Transactional registry store on top of redb.
//!
//! Each public operation is one transaction; multi-row mutations (register
//! task + pending event, completion event + lock release) commit atomically.
//! redb serializes write transactions, which is what makes the conditional
//! lock upsert linearizable per lock name.

mod builds;
pub mod orgs;
pub mod rows;
pub mod search;
pub mod status;
mod workspaces;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use stardag_types::EventType;

use crate::db::{self, DbHandle};
use crate::error::RegistryError;

use rows::EventRow;

pub use search::SuggestionCache;

pub(crate) type BytesTable<'db, 'txn> = redb::Table<'db, 'txn, &'static str, &'static [u8]>;
pub(crate) type SeqTable<'db, 'txn> = redb::Table<'db, 'txn, &'static str, u64>;

#[derive(Clone)]
pub struct Store {
    db: DbHandle,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let db = db::open_db(path)?;
        let store = Self { db };
        store.ensure_seed()?;
        Ok(store)
    }

    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub(crate) fn db(&self) -> &Arc<redb::Database> {
        &self.db
    }
}

pub(crate) fn encode<T: Serialize>(row: &T) -> Result<Vec<u8>, RegistryError> {
    Ok(bincode::serialize(row)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RegistryError> {
    Ok(bincode::deserialize(bytes)?)
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn ts_micros(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_micros().max(0) as u64
}

/// Bump a monotonic counter in the meta table and return the new value.
pub(crate) fn bump_seq(
    meta: &mut SeqTable<'_, '_>,
    key: &str,
) -> Result<u64, RegistryError> {
    let current = meta.get(key)?.map(|g| g.value()).unwrap_or(0);
    let next = current + 1;
    meta.insert(key, next)?;
    Ok(next)
}

/// Append one lifecycle event inside an open write transaction, keeping the
/// per-build stream and the per-task index in step.
pub(crate) fn append_event_tx(
    events: &mut BytesTable<'_, '_>,
    events_by_task: &mut BytesTable<'_, '_>,
    meta: &mut SeqTable<'_, '_>,
    build_id: &str,
    task_pk: Option<u64>,
    event_type: EventType,
    error_message: Option<String>,
    metadata: Option<String>,
) -> Result<EventRow, RegistryError> {
    let seq = bump_seq(meta, db::META_EVENT_SEQ)?;
    let row = EventRow {
        id: new_id(),
        seq,
        build_id: build_id.to_string(),
        task_pk,
        event_type,
        created_at: Utc::now(),
        error_message,
        metadata,
    };
    let encoded = encode(&row)?;
    events.insert(
        db::key2(build_id, &db::padded(seq)).as_str(),
        encoded.as_slice(),
    )?;
    if let Some(pk) = task_pk {
        events_by_task.insert(
            db::key2(&db::padded(pk), &db::padded(seq)).as_str(),
            encoded.as_slice(),
        )?;
    }
    Ok(row)
}

/// Collect every event of a build, oldest first.
pub(crate) fn events_of_build(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    build_id: &str,
) -> Result<Vec<EventRow>, RegistryError> {
    let (start, end) = db::prefix_range(build_id);
    let mut out = Vec::new();
    for item in table.range(start.as_str()..end.as_str())? {
        let (_, value) = item?;
        out.push(decode::<EventRow>(value.value())?);
    }
    Ok(out)
}

/// Collect every event referencing a task pk, oldest first.
pub(crate) fn events_of_task(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    task_pk: u64,
) -> Result<Vec<EventRow>, RegistryError> {
    let (start, end) = db::prefix_range(&db::padded(task_pk));
    let mut out = Vec::new();
    for item in table.range(start.as_str()..end.as_str())? {
        let (_, value) = item?;
        out.push(decode::<EventRow>(value.value())?);
    }
    Ok(out)
}
