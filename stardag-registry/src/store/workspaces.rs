//! Environments and their scoped resources: API keys and target roots.

use chrono::Utc;
use redb::ReadableTable;

use stardag_types::{validate_slug, CreateEnvironmentRequest};

use crate::auth::api_key;
use crate::db;
use crate::error::RegistryError;

use super::rows::{ApiKeyRow, BuildRow, EnvironmentRow, TargetRootRow, TaskRow};
use super::{decode, encode, new_id, Store};

impl Store {
    pub fn get_environment(&self, env_id: &str) -> Result<EnvironmentRow, RegistryError> {
        let txn = self.db().begin_read()?;
        let environments = txn.open_table(db::ENVIRONMENTS)?;
        let guard = environments
            .get(env_id)?
            .ok_or_else(|| RegistryError::NotFound("environment".to_string()))?;
        decode(guard.value())
    }

    pub fn list_environments(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<EnvironmentRow>, RegistryError> {
        let txn = self.db().begin_read()?;
        let environments = txn.open_table(db::ENVIRONMENTS)?;
        let mut out = Vec::new();
        for item in environments.iter()? {
            let (_, value) = item?;
            let env: EnvironmentRow = decode(value.value())?;
            if env.workspace_id == workspace_id {
                out.push(env);
            }
        }
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(out)
    }

    pub fn create_environment(
        &self,
        workspace_id: &str,
        req: &CreateEnvironmentRequest,
    ) -> Result<EnvironmentRow, RegistryError> {
        validate_slug(&req.slug).map_err(|e| RegistryError::Validation(e.to_string()))?;

        let txn = self.db().begin_write()?;
        let env = {
            let mut environment_slugs = txn.open_table(db::ENVIRONMENT_SLUGS)?;
            let slug_key = db::key2(workspace_id, &req.slug);
            if environment_slugs.get(slug_key.as_str())?.is_some() {
                return Err(RegistryError::Conflict(format!(
                    "environment slug '{}' already exists in this workspace",
                    req.slug
                )));
            }

            let env = EnvironmentRow {
                id: new_id(),
                workspace_id: workspace_id.to_string(),
                slug: req.slug.clone(),
                name: req.name.clone(),
                description: req.description.clone(),
                owner_user_id: req.owner_user_id.clone(),
                max_concurrent_locks: req.max_concurrent_locks,
                created_at: Utc::now(),
            };
            let mut environments = txn.open_table(db::ENVIRONMENTS)?;
            environments.insert(env.id.as_str(), encode(&env)?.as_slice())?;
            environment_slugs.insert(slug_key.as_str(), env.id.as_str())?;
            env
        };
        txn.commit()?;
        Ok(env)
    }

    /// A workspace must retain at least one environment.
    pub fn delete_environment(&self, env_id: &str) -> Result<(), RegistryError> {
        let env = self.get_environment(env_id)?;
        let siblings = self.list_environments(&env.workspace_id)?;
        if siblings.len() <= 1 {
            return Err(RegistryError::Validation(
                "cannot delete the workspace's only environment".to_string(),
            ));
        }

        let txn = self.db().begin_write()?;
        {
            let mut environments = txn.open_table(db::ENVIRONMENTS)?;
            environments.remove(env_id)?;
            let mut environment_slugs = txn.open_table(db::ENVIRONMENT_SLUGS)?;
            environment_slugs.remove(db::key2(&env.workspace_id, &env.slug).as_str())?;
            self.delete_environment_scoped_data(&txn, env_id)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove builds, events, tasks, dependencies, assets, locks, API keys
    /// and target roots belonging to an environment. Runs inside the
    /// caller's write transaction.
    pub(crate) fn delete_environment_scoped_data(
        &self,
        txn: &redb::WriteTransaction,
        env_id: &str,
    ) -> Result<(), RegistryError> {
        let (env_start, env_end) = db::prefix_range(env_id);

        // Builds and their event streams.
        {
            let mut builds_by_env = txn.open_table(db::BUILDS_BY_ENV)?;
            let build_ids: Vec<String> = builds_by_env
                .range(env_start.as_str()..env_end.as_str())?
                .map(|item| item.map(|(_, v)| v.value().to_string()))
                .collect::<Result<_, _>>()?;

            let index_keys: Vec<String> = builds_by_env
                .range(env_start.as_str()..env_end.as_str())?
                .map(|item| item.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()?;
            for key in index_keys {
                builds_by_env.remove(key.as_str())?;
            }

            let mut builds = txn.open_table(db::BUILDS)?;
            let mut events = txn.open_table(db::EVENTS)?;
            for build_id in build_ids {
                builds.remove(build_id.as_str())?;
                let (start, end) = db::prefix_range(&build_id);
                let keys: Vec<String> = events
                    .range(start.as_str()..end.as_str())?
                    .map(|item| item.map(|(k, _)| k.value().to_string()))
                    .collect::<Result<_, _>>()?;
                for key in keys {
                    events.remove(key.as_str())?;
                }
            }
        }

        // Tasks with their indexes, per-task events, dependencies, assets.
        {
            let mut tasks_by_env = txn.open_table(db::TASKS_BY_ENV)?;
            let pks: Vec<u64> = tasks_by_env
                .range(env_start.as_str()..env_end.as_str())?
                .map(|item| item.map(|(_, v)| v.value()))
                .collect::<Result<_, _>>()?;
            let index_keys: Vec<String> = tasks_by_env
                .range(env_start.as_str()..env_end.as_str())?
                .map(|item| item.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()?;
            for key in index_keys {
                tasks_by_env.remove(key.as_str())?;
            }

            let mut tasks = txn.open_table(db::TASKS)?;
            let mut tasks_by_task_id = txn.open_table(db::TASKS_BY_TASK_ID)?;
            let mut events_by_task = txn.open_table(db::EVENTS_BY_TASK)?;
            let mut deps_down = txn.open_table(db::TASK_DEPS_DOWN)?;
            let mut deps_up = txn.open_table(db::TASK_DEPS_UP)?;
            let mut assets = txn.open_table(db::ASSETS)?;

            for pk in pks {
                if let Some(guard) = tasks.remove(pk)? {
                    let task: TaskRow = decode(guard.value())?;
                    tasks_by_task_id.remove(db::key2(env_id, &task.task_id).as_str())?;
                }
                let padded = db::padded(pk);
                for table in [&mut events_by_task, &mut assets] {
                    let (start, end) = db::prefix_range(&padded);
                    let keys: Vec<String> = table
                        .range(start.as_str()..end.as_str())?
                        .map(|item| item.map(|(k, _)| k.value().to_string()))
                        .collect::<Result<_, _>>()?;
                    for key in keys {
                        table.remove(key.as_str())?;
                    }
                }
                for table in [&mut deps_down, &mut deps_up] {
                    let (start, end) = db::prefix_range(&padded);
                    let keys: Vec<String> = table
                        .range(start.as_str()..end.as_str())?
                        .map(|item| item.map(|(k, _)| k.value().to_string()))
                        .collect::<Result<_, _>>()?;
                    for key in keys {
                        table.remove(key.as_str())?;
                    }
                }
            }
        }

        // Locks.
        {
            let mut locks_by_env = txn.open_table(db::LOCKS_BY_ENV)?;
            let names: Vec<String> = locks_by_env
                .range(env_start.as_str()..env_end.as_str())?
                .map(|item| item.map(|(_, v)| v.value().to_string()))
                .collect::<Result<_, _>>()?;
            let index_keys: Vec<String> = locks_by_env
                .range(env_start.as_str()..env_end.as_str())?
                .map(|item| item.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()?;
            for key in index_keys {
                locks_by_env.remove(key.as_str())?;
            }
            let mut locks = txn.open_table(db::LOCKS)?;
            for name in names {
                locks.remove(name.as_str())?;
            }
        }

        // API keys and target roots.
        {
            let mut api_keys = txn.open_table(db::API_KEYS)?;
            let mut api_keys_by_prefix = txn.open_table(db::API_KEYS_BY_PREFIX)?;
            let to_remove: Vec<(String, String)> = {
                let mut out = Vec::new();
                for item in api_keys.iter()? {
                    let (key, value) = item?;
                    let row: ApiKeyRow = decode(value.value())?;
                    if row.environment_id == env_id {
                        out.push((key.value().to_string(), row.key_prefix));
                    }
                }
                out
            };
            for (id, prefix) in to_remove {
                api_keys.remove(id.as_str())?;
                api_keys_by_prefix.remove(db::key2(&prefix, &id).as_str())?;
            }

            let mut target_roots = txn.open_table(db::TARGET_ROOTS)?;
            let keys: Vec<String> = target_roots
                .range(env_start.as_str()..env_end.as_str())?
                .map(|item| item.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()?;
            for key in keys {
                target_roots.remove(key.as_str())?;
            }
        }

        Ok(())
    }

    pub fn create_api_key(
        &self,
        env_id: &str,
        name: &str,
        created_by: Option<&str>,
    ) -> Result<(ApiKeyRow, String), RegistryError> {
        // Ensure the environment exists before minting a credential for it.
        self.get_environment(env_id)?;

        let (full_key, prefix) = api_key::generate_key();
        let row = ApiKeyRow {
            id: new_id(),
            environment_id: env_id.to_string(),
            name: name.to_string(),
            key_prefix: prefix,
            key_hash: api_key::hash_key(&full_key),
            created_by: created_by.map(str::to_string),
            created_at: Utc::now(),
            last_used_at: None,
            revoked_at: None,
        };

        let txn = self.db().begin_write()?;
        {
            let mut api_keys = txn.open_table(db::API_KEYS)?;
            api_keys.insert(row.id.as_str(), encode(&row)?.as_slice())?;
            let mut by_prefix = txn.open_table(db::API_KEYS_BY_PREFIX)?;
            by_prefix.insert(
                db::key2(&row.key_prefix, &row.id).as_str(),
                row.id.as_str(),
            )?;
        }
        txn.commit()?;
        Ok((row, full_key))
    }

    pub fn list_api_keys(&self, env_id: &str) -> Result<Vec<ApiKeyRow>, RegistryError> {
        let txn = self.db().begin_read()?;
        let api_keys = txn.open_table(db::API_KEYS)?;
        let mut out = Vec::new();
        for item in api_keys.iter()? {
            let (_, value) = item?;
            let row: ApiKeyRow = decode(value.value())?;
            if row.environment_id == env_id {
                out.push(row);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    pub fn revoke_api_key(&self, env_id: &str, key_id: &str) -> Result<(), RegistryError> {
        let txn = self.db().begin_write()?;
        {
            let mut api_keys = txn.open_table(db::API_KEYS)?;
            let mut row: ApiKeyRow = {
                let guard = api_keys
                    .get(key_id)?
                    .ok_or_else(|| RegistryError::NotFound("api key".to_string()))?;
                decode(guard.value())?
            };
            if row.environment_id != env_id {
                return Err(RegistryError::NotFound("api key".to_string()));
            }
            if row.revoked_at.is_none() {
                row.revoked_at = Some(Utc::now());
                api_keys.insert(key_id, encode(&row)?.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Resolve a presented API key: candidates by prefix, constant-time hash
    /// compare, then a `last_used_at` touch.
    pub fn resolve_api_key(&self, presented: &str) -> Result<ApiKeyRow, RegistryError> {
        let prefix: String = presented.chars().take(api_key::PREFIX_LEN).collect();

        let candidate_ids: Vec<String> = {
            let txn = self.db().begin_read()?;
            let by_prefix = txn.open_table(db::API_KEYS_BY_PREFIX)?;
            let (start, end) = db::prefix_range(&prefix);
            let collected = by_prefix
                .range(start.as_str()..end.as_str())?
                .map(|item| item.map(|(_, v)| v.value().to_string()))
                .collect::<Result<_, _>>()?;
            collected
        };

        let txn = self.db().begin_write()?;
        let resolved = {
            let mut api_keys = txn.open_table(db::API_KEYS)?;
            let mut resolved: Option<ApiKeyRow> = None;
            for id in candidate_ids {
                let row: ApiKeyRow = match api_keys.get(id.as_str())? {
                    Some(guard) => decode(guard.value())?,
                    None => continue,
                };
                if api_key::verify_key(presented, &row.key_hash) {
                    if !row.is_active() {
                        return Err(RegistryError::Auth("api key revoked".to_string()));
                    }
                    let mut touched = row.clone();
                    touched.last_used_at = Some(Utc::now());
                    api_keys.insert(id.as_str(), encode(&touched)?.as_slice())?;
                    resolved = Some(touched);
                    break;
                }
            }
            resolved
        };
        txn.commit()?;

        resolved.ok_or_else(|| RegistryError::Auth("invalid api key".to_string()))
    }

    pub fn list_target_roots(&self, env_id: &str) -> Result<Vec<TargetRootRow>, RegistryError> {
        let txn = self.db().begin_read()?;
        let target_roots = txn.open_table(db::TARGET_ROOTS)?;
        let (start, end) = db::prefix_range(env_id);
        let mut out = Vec::new();
        for item in target_roots.range(start.as_str()..end.as_str())? {
            let (_, value) = item?;
            out.push(decode::<TargetRootRow>(value.value())?);
        }
        Ok(out)
    }

    pub fn create_target_root(
        &self,
        env_id: &str,
        name: &str,
        uri: &str,
    ) -> Result<TargetRootRow, RegistryError> {
        let txn = self.db().begin_write()?;
        let row = {
            let mut target_roots = txn.open_table(db::TARGET_ROOTS)?;
            let key = db::key2(env_id, name);
            if target_roots.get(key.as_str())?.is_some() {
                return Err(RegistryError::Conflict(format!(
                    "target root '{name}' already exists"
                )));
            }
            let row = TargetRootRow {
                environment_id: env_id.to_string(),
                name: name.to_string(),
                uri: uri.to_string(),
            };
            target_roots.insert(key.as_str(), encode(&row)?.as_slice())?;
            row
        };
        txn.commit()?;
        Ok(row)
    }

    pub fn update_target_root(
        &self,
        env_id: &str,
        name: &str,
        uri: &str,
    ) -> Result<TargetRootRow, RegistryError> {
        let txn = self.db().begin_write()?;
        let row = {
            let mut target_roots = txn.open_table(db::TARGET_ROOTS)?;
            let key = db::key2(env_id, name);
            if target_roots.get(key.as_str())?.is_none() {
                return Err(RegistryError::NotFound("target root".to_string()));
            }
            let row = TargetRootRow {
                environment_id: env_id.to_string(),
                name: name.to_string(),
                uri: uri.to_string(),
            };
            target_roots.insert(key.as_str(), encode(&row)?.as_slice())?;
            row
        };
        txn.commit()?;
        Ok(row)
    }

    pub fn delete_target_root(&self, env_id: &str, name: &str) -> Result<(), RegistryError> {
        let txn = self.db().begin_write()?;
        {
            let mut target_roots = txn.open_table(db::TARGET_ROOTS)?;
            if target_roots
                .remove(db::key2(env_id, name).as_str())?
                .is_none()
            {
                return Err(RegistryError::NotFound("target root".to_string()));
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Newest-first page of builds in an environment, by the
    /// `(environment, created_at)` index.
    pub fn builds_in_env_page(
        &self,
        env_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<BuildRow>, u64), RegistryError> {
        let txn = self.db().begin_read()?;
        let builds_by_env = txn.open_table(db::BUILDS_BY_ENV)?;
        let builds = txn.open_table(db::BUILDS)?;

        let (start, end) = db::prefix_range(env_id);
        let ids: Vec<String> = builds_by_env
            .range(start.as_str()..end.as_str())?
            .rev()
            .map(|item| item.map(|(_, v)| v.value().to_string()))
            .collect::<Result<_, _>>()?;

        let total = ids.len() as u64;
        let offset = (page.saturating_sub(1) as usize) * page_size as usize;
        let mut out = Vec::new();
        for id in ids.into_iter().skip(offset).take(page_size as usize) {
            if let Some(guard) = builds.get(id.as_str())? {
                out.push(decode::<BuildRow>(guard.value())?);
            }
        }
        Ok((out, total))
    }
}
