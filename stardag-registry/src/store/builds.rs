//! Builds, tasks, dependency edges, events and registry assets.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use redb::ReadableTable;

use stardag_types::{
    AssetUpload, CreateBuildRequest, EventType, GraphEdge, GraphNode, RegisterTaskRequest,
    TaskGraphResponse,
};

use crate::db;
use crate::error::RegistryError;
use crate::names::generate_build_name;

use super::rows::{AssetRow, BuildRow, EventRow, TaskRow};
use super::status::{derive_build_status, fold_task_statuses, TaskStatusInfo};
use super::{
    append_event_tx, bump_seq, decode, encode, events_of_build, events_of_task, new_id, ts_micros,
    Store,
};

impl Store {
    /// Create a build and append its BUILD_STARTED event atomically.
    pub fn create_build(
        &self,
        env_id: &str,
        user_id: Option<&str>,
        req: &CreateBuildRequest,
    ) -> Result<BuildRow, RegistryError> {
        self.get_environment(env_id)?;

        let row = BuildRow {
            id: new_id(),
            environment_id: env_id.to_string(),
            user_id: user_id.map(str::to_string),
            name: generate_build_name(),
            description: req.description.clone(),
            commit_hash: req.commit_hash.clone(),
            root_task_ids: req.root_task_ids.clone(),
            created_at: Utc::now(),
        };

        let txn = self.db().begin_write()?;
        {
            let mut builds = txn.open_table(db::BUILDS)?;
            builds.insert(row.id.as_str(), encode(&row)?.as_slice())?;

            let mut builds_by_env = txn.open_table(db::BUILDS_BY_ENV)?;
            builds_by_env.insert(
                db::key3(env_id, &db::padded(ts_micros(row.created_at)), &row.id).as_str(),
                row.id.as_str(),
            )?;

            let mut events = txn.open_table(db::EVENTS)?;
            let mut events_by_task = txn.open_table(db::EVENTS_BY_TASK)?;
            let mut meta = txn.open_table(db::META)?;
            append_event_tx(
                &mut events,
                &mut events_by_task,
                &mut meta,
                &row.id,
                None,
                EventType::BuildStarted,
                None,
                None,
            )?;
        }
        txn.commit()?;
        Ok(row)
    }

    pub fn get_build_row(&self, build_id: &str) -> Result<BuildRow, RegistryError> {
        let txn = self.db().begin_read()?;
        let builds = txn.open_table(db::BUILDS)?;
        let guard = builds
            .get(build_id)?
            .ok_or_else(|| RegistryError::NotFound("build".to_string()))?;
        decode(guard.value())
    }

    pub fn build_events(&self, build_id: &str) -> Result<Vec<EventRow>, RegistryError> {
        self.get_build_row(build_id)?;
        let txn = self.db().begin_read()?;
        let events = txn.open_table(db::EVENTS)?;
        events_of_build(&events, build_id)
    }

    /// Append a build-scoped terminal event (BUILD_COMPLETED / BUILD_FAILED).
    pub fn append_build_event(
        &self,
        build_id: &str,
        event_type: EventType,
        error_message: Option<String>,
    ) -> Result<BuildRow, RegistryError> {
        let row = self.get_build_row(build_id)?;
        let txn = self.db().begin_write()?;
        {
            let mut events = txn.open_table(db::EVENTS)?;
            let mut events_by_task = txn.open_table(db::EVENTS_BY_TASK)?;
            let mut meta = txn.open_table(db::META)?;
            append_event_tx(
                &mut events,
                &mut events_by_task,
                &mut meta,
                build_id,
                None,
                event_type,
                error_message,
                None,
            )?;
        }
        txn.commit()?;
        Ok(row)
    }

    /// Register a task against a build. Deduplicated on
    /// `(environment, task_id)`: an existing row is reused and only a
    /// TASK_PENDING event is appended. Dependency edges are recorded for
    /// upstream tasks already known to the environment.
    pub fn register_task(
        &self,
        build_id: &str,
        req: &RegisterTaskRequest,
    ) -> Result<TaskRow, RegistryError> {
        let build = self.get_build_row(build_id)?;
        let env_id = build.environment_id.as_str();

        let txn = self.db().begin_write()?;
        let task = {
            let mut tasks = txn.open_table(db::TASKS)?;
            let mut tasks_by_task_id = txn.open_table(db::TASKS_BY_TASK_ID)?;
            let mut meta = txn.open_table(db::META)?;

            let id_key = db::key2(env_id, &req.task_id);
            let existing_pk = tasks_by_task_id.get(id_key.as_str())?.map(|g| g.value());

            let task = match existing_pk {
                Some(pk) => {
                    let guard = tasks.get(pk)?.ok_or_else(|| {
                        RegistryError::Internal("task index dangling".to_string())
                    })?;
                    decode::<TaskRow>(guard.value())?
                }
                None => {
                    let pk = bump_seq(&mut meta, db::META_TASK_PK_SEQ)?;
                    let task = TaskRow {
                        pk,
                        task_id: req.task_id.clone(),
                        environment_id: env_id.to_string(),
                        task_namespace: req.task_namespace.clone(),
                        task_name: req.task_name.clone(),
                        task_data: serde_json::to_string(&req.task_data)?,
                        version: req.version.clone(),
                        created_at: Utc::now(),
                    };
                    tasks.insert(pk, encode(&task)?.as_slice())?;
                    tasks_by_task_id.insert(id_key.as_str(), pk)?;

                    let mut tasks_by_env = txn.open_table(db::TASKS_BY_ENV)?;
                    tasks_by_env.insert(
                        db::key3(env_id, &db::padded(ts_micros(task.created_at)), &db::padded(pk))
                            .as_str(),
                        pk,
                    )?;

                    let mut deps_down = txn.open_table(db::TASK_DEPS_DOWN)?;
                    let mut deps_up = txn.open_table(db::TASK_DEPS_UP)?;
                    for dep_hash in &req.dependency_task_ids {
                        let dep_key = db::key2(env_id, dep_hash);
                        let Some(upstream_pk) =
                            tasks_by_task_id.get(dep_key.as_str())?.map(|g| g.value())
                        else {
                            // Upstream not registered yet; edge is recorded
                            // when the SDK registers in dependency order.
                            continue;
                        };
                        deps_down.insert(
                            db::key2(&db::padded(upstream_pk), &db::padded(pk)).as_str(),
                            (),
                        )?;
                        deps_up.insert(
                            db::key2(&db::padded(pk), &db::padded(upstream_pk)).as_str(),
                            (),
                        )?;
                    }

                    task
                }
            };

            let mut events = txn.open_table(db::EVENTS)?;
            let mut events_by_task = txn.open_table(db::EVENTS_BY_TASK)?;
            append_event_tx(
                &mut events,
                &mut events_by_task,
                &mut meta,
                build_id,
                Some(task.pk),
                EventType::TaskPending,
                None,
                None,
            )?;

            task
        };
        txn.commit()?;
        Ok(task)
    }

    /// Append a task lifecycle event (started / completed / failed) and
    /// return the task with its newly derived status in this build.
    pub fn append_task_event(
        &self,
        build_id: &str,
        task_hash: &str,
        event_type: EventType,
        error_message: Option<String>,
    ) -> Result<(TaskRow, TaskStatusInfo), RegistryError> {
        let build = self.get_build_row(build_id)?;
        let task = self.get_task(&build.environment_id, task_hash)?;

        let txn = self.db().begin_write()?;
        {
            let mut events = txn.open_table(db::EVENTS)?;
            let mut events_by_task = txn.open_table(db::EVENTS_BY_TASK)?;
            let mut meta = txn.open_table(db::META)?;
            append_event_tx(
                &mut events,
                &mut events_by_task,
                &mut meta,
                build_id,
                Some(task.pk),
                event_type,
                error_message,
                None,
            )?;
        }
        txn.commit()?;

        let events = self.build_events(build_id)?;
        let statuses = fold_task_statuses(&events);
        let info = statuses.get(&task.pk).cloned().unwrap_or_default();
        Ok((task, info))
    }

    pub fn build_status(
        &self,
        build_id: &str,
    ) -> Result<
        (
            BuildRow,
            stardag_types::BuildStatus,
            Option<chrono::DateTime<Utc>>,
            Option<chrono::DateTime<Utc>>,
        ),
        RegistryError,
    > {
        let row = self.get_build_row(build_id)?;
        let events = self.build_events(build_id)?;
        let (status, started_at, completed_at) = derive_build_status(&events);
        Ok((row, status, started_at, completed_at))
    }

    /// All tasks a build touched, with statuses, from one pass over events.
    pub fn tasks_in_build(
        &self,
        build_id: &str,
    ) -> Result<Vec<(TaskRow, TaskStatusInfo)>, RegistryError> {
        let events = self.build_events(build_id)?;
        let statuses = fold_task_statuses(&events);

        let txn = self.db().begin_read()?;
        let tasks = txn.open_table(db::TASKS)?;
        let mut out = Vec::new();
        let mut pks: Vec<u64> = statuses.keys().copied().collect();
        pks.sort_unstable();
        for pk in pks {
            let Some(guard) = tasks.get(pk)? else { continue };
            let task: TaskRow = decode(guard.value())?;
            out.push((task, statuses[&pk].clone()));
        }
        Ok(out)
    }

    /// Resolve task content hashes for a set of events in one pass.
    pub fn resolve_task_hashes(
        &self,
        events: &[EventRow],
    ) -> Result<HashMap<u64, String>, RegistryError> {
        let txn = self.db().begin_read()?;
        let tasks = txn.open_table(db::TASKS)?;
        let mut out = HashMap::new();
        for event in events {
            let Some(pk) = event.task_pk else { continue };
            if out.contains_key(&pk) {
                continue;
            }
            if let Some(guard) = tasks.get(pk)? {
                let task: TaskRow = decode(guard.value())?;
                out.insert(pk, task.task_id);
            }
        }
        Ok(out)
    }

    /// Nodes and deduplicated edges among the tasks this build touched.
    pub fn build_graph(&self, build_id: &str) -> Result<TaskGraphResponse, RegistryError> {
        let tasks = self.tasks_in_build(build_id)?;
        let in_build: HashSet<u64> = tasks.iter().map(|(t, _)| t.pk).collect();
        let hash_of: HashMap<u64, String> = tasks
            .iter()
            .map(|(t, _)| (t.pk, t.task_id.clone()))
            .collect();

        let txn = self.db().begin_read()?;
        let deps_down = txn.open_table(db::TASK_DEPS_DOWN)?;

        let mut edges = Vec::new();
        for pk in &in_build {
            let (start, end) = db::prefix_range(&db::padded(*pk));
            for item in deps_down.range(start.as_str()..end.as_str())? {
                let (key, _) = item?;
                let key = key.value();
                let downstream: u64 = key
                    .rsplit('/')
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| RegistryError::Internal("malformed dep key".to_string()))?;
                if in_build.contains(&downstream) {
                    edges.push(GraphEdge {
                        upstream: hash_of[pk].clone(),
                        downstream: hash_of[&downstream].clone(),
                    });
                }
            }
        }
        edges.sort_by(|a, b| (&a.upstream, &a.downstream).cmp(&(&b.upstream, &b.downstream)));

        let nodes = tasks
            .iter()
            .map(|(task, info)| GraphNode {
                task_id: task.task_id.clone(),
                task_namespace: task.task_namespace.clone(),
                task_name: task.task_name.clone(),
                status: info.status(),
            })
            .collect();

        Ok(TaskGraphResponse { nodes, edges })
    }

    pub fn get_task(&self, env_id: &str, task_hash: &str) -> Result<TaskRow, RegistryError> {
        let txn = self.db().begin_read()?;
        let tasks_by_task_id = txn.open_table(db::TASKS_BY_TASK_ID)?;
        let pk = tasks_by_task_id
            .get(db::key2(env_id, task_hash).as_str())?
            .map(|g| g.value())
            .ok_or_else(|| RegistryError::NotFound("task".to_string()))?;
        let tasks = txn.open_table(db::TASKS)?;
        let guard = tasks
            .get(pk)?
            .ok_or_else(|| RegistryError::Internal("task index dangling".to_string()))?;
        decode(guard.value())
    }

    pub fn find_task(
        &self,
        env_id: &str,
        task_hash: &str,
    ) -> Result<Option<TaskRow>, RegistryError> {
        match self.get_task(env_id, task_hash) {
            Ok(task) => Ok(Some(task)),
            Err(RegistryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Newest-first page of tasks in an environment.
    pub fn tasks_in_env_page(
        &self,
        env_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<TaskRow>, u64), RegistryError> {
        let txn = self.db().begin_read()?;
        let tasks_by_env = txn.open_table(db::TASKS_BY_ENV)?;
        let tasks = txn.open_table(db::TASKS)?;

        let (start, end) = db::prefix_range(env_id);
        let pks: Vec<u64> = tasks_by_env
            .range(start.as_str()..end.as_str())?
            .rev()
            .map(|item| item.map(|(_, v)| v.value()))
            .collect::<Result<_, _>>()?;

        let total = pks.len() as u64;
        let offset = (page.saturating_sub(1) as usize) * page_size as usize;
        let mut out = Vec::new();
        for pk in pks.into_iter().skip(offset).take(page_size as usize) {
            if let Some(guard) = tasks.get(pk)? {
                out.push(decode::<TaskRow>(guard.value())?);
            }
        }
        Ok((out, total))
    }

    /// The `limit` most recently created tasks in an environment.
    pub fn recent_tasks(&self, env_id: &str, limit: usize) -> Result<Vec<TaskRow>, RegistryError> {
        let (tasks, _) = self.tasks_in_env_page(env_id, 1, limit as u32)?;
        Ok(tasks)
    }

    pub fn events_for_task(&self, task_pk: u64) -> Result<Vec<EventRow>, RegistryError> {
        let txn = self.db().begin_read()?;
        let events_by_task = txn.open_table(db::EVENTS_BY_TASK)?;
        events_of_task(&events_by_task, task_pk)
    }

    /// Attach uploaded assets to a task registered in the build's environment.
    pub fn upload_assets(
        &self,
        build_id: &str,
        task_hash: &str,
        assets: &[AssetUpload],
    ) -> Result<Vec<AssetRow>, RegistryError> {
        let build = self.get_build_row(build_id)?;
        let task = self.get_task(&build.environment_id, task_hash)?;

        let txn = self.db().begin_write()?;
        let rows = {
            let mut table = txn.open_table(db::ASSETS)?;
            let mut rows = Vec::new();
            for upload in assets {
                let row = AssetRow {
                    id: new_id(),
                    task_pk: task.pk,
                    asset_type: upload.asset_type,
                    name: upload.name.clone(),
                    body: serde_json::to_string(&upload.body)?,
                    created_at: Utc::now(),
                };
                table.insert(
                    db::key2(&db::padded(task.pk), &row.id).as_str(),
                    encode(&row)?.as_slice(),
                )?;
                rows.push(row);
            }
            rows
        };
        txn.commit()?;
        Ok(rows)
    }

    pub fn list_assets(&self, env_id: &str, task_hash: &str) -> Result<Vec<AssetRow>, RegistryError> {
        let task = self.get_task(env_id, task_hash)?;
        let txn = self.db().begin_read()?;
        let assets = txn.open_table(db::ASSETS)?;
        let (start, end) = db::prefix_range(&db::padded(task.pk));
        let mut out = Vec::new();
        for item in assets.range(start.as_str()..end.as_str())? {
            let (_, value) = item?;
            out.push(decode::<AssetRow>(value.value())?);
        }
        Ok(out)
    }

    pub fn count_assets(&self, task_pk: u64) -> Result<u64, RegistryError> {
        let txn = self.db().begin_read()?;
        let assets = txn.open_table(db::ASSETS)?;
        let (start, end) = db::prefix_range(&db::padded(task_pk));
        let mut count = 0;
        for item in assets.range(start.as_str()..end.as_str())? {
            item?;
            count += 1;
        }
        Ok(count)
    }
}
