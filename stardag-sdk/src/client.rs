//! HTTP client for the registry API: implements the engine's `Registry`
//! seam plus the lock manager against `/api/v1`.

use std::collections::HashSet;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use tokio::sync::RwLock;

use stardag_types::{
    AssetUpload, BuildResponse, CreateBuildRequest, LockAcquireRequest, LockAcquireResponse,
    LockAcquireStatus, LockReleaseRequest, LockRenewRequest, RegisterTaskRequest, TaskStatus,
    TaskWithStatusResponse, UploadAssetsRequest,
};

use crate::error::RegistryClientError;
use crate::lock_manager::{LockAttempt, LockManager};
use crate::params::wire_document;
use crate::registry::Registry;
use crate::task::{Task, TaskRef};

/// Supplies a fresh internal token after the cached one expires.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<String, RegistryClientError>;
}

#[derive(Debug, Clone)]
pub struct ApiRegistryConfig {
    pub api_url: String,
    /// Environment-scoped API key; takes precedence over token auth.
    pub api_key: Option<String>,
    /// Workspace-scoped internal token (UI/token auth path).
    pub access_token: Option<String>,
    /// Required with token auth; implied by the key with API-key auth.
    pub environment_id: Option<String>,
    pub timeout: Duration,
}

impl ApiRegistryConfig {
    /// Resolve from environment variables and the active profile
    /// (`~/.stardag/config.toml`), environment winning.
    pub fn from_settings() -> Result<Self, RegistryClientError> {
        let settings = stardag_config::ClientSettings::load()
            .map_err(|e| RegistryClientError::Config(e.to_string()))?;
        Ok(Self {
            api_url: settings.registry_url.ok_or_else(|| {
                RegistryClientError::Config(
                    "no registry url configured (STARDAG_REGISTRY_URL or profile)".to_string(),
                )
            })?,
            api_key: settings.api_key,
            access_token: settings.access_token,
            environment_id: settings.environment_id,
            timeout: settings.timeout,
        })
    }
}

pub struct ApiRegistry {
    config: ApiRegistryConfig,
    client: reqwest::Client,
    access_token: RwLock<Option<String>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl ApiRegistry {
    pub fn new(config: ApiRegistryConfig) -> Self {
        let access_token = RwLock::new(config.access_token.clone());
        Self {
            config,
            client: reqwest::Client::new(),
            access_token,
            refresher: None,
        }
    }

    pub fn from_settings() -> Result<Self, RegistryClientError> {
        Ok(Self::new(ApiRegistryConfig::from_settings()?))
    }

    pub fn with_token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.config.api_url.trim_end_matches('/'))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<Response, RegistryClientError> {
        let mut attempted_refresh = false;
        loop {
            let mut request = self
                .client
                .request(method.clone(), self.url(path))
                .timeout(self.config.timeout);

            let mut query_pairs: Vec<(&str, String)> = query.to_vec();
            if let Some(key) = &self.config.api_key {
                request = request.header("x-api-key", key);
            } else {
                if let Some(token) = self.access_token.read().await.clone() {
                    request = request.bearer_auth(token);
                }
                if let Some(env) = &self.config.environment_id {
                    query_pairs.push(("environment_id", env.clone()));
                }
            }
            if !query_pairs.is_empty() {
                request = request.query(&query_pairs);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request.send().await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            // One-shot transparent refresh on an expired internal token.
            let detail: serde_json::Value = response.json().await.unwrap_or_default();
            let expired = detail.get("code").and_then(|c| c.as_str()) == Some("token_expired");
            if expired && !attempted_refresh {
                if let Some(refresher) = &self.refresher {
                    let fresh = refresher.refresh().await?;
                    *self.access_token.write().await = Some(fresh);
                    attempted_refresh = true;
                    continue;
                }
                return Err(RegistryClientError::TokenExpired);
            }
            let message = detail
                .get("detail")
                .and_then(|d| d.as_str())
                .unwrap_or("unauthorized")
                .to_string();
            return Err(if expired {
                RegistryClientError::TokenExpired
            } else {
                RegistryClientError::Auth(message)
            });
        }
    }

    async fn expect_success(
        &self,
        response: Response,
        operation: &str,
    ) -> Result<Response, RegistryClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail: serde_json::Value = response.json().await.unwrap_or_default();
        let message = detail
            .get("detail")
            .and_then(|d| d.as_str())
            .unwrap_or(operation)
            .to_string();
        Err(match status {
            StatusCode::FORBIDDEN => RegistryClientError::WorkspaceAccess(message),
            StatusCode::NOT_FOUND => RegistryClientError::NotFound(message),
            _ => RegistryClientError::Api {
                status: status.as_u16(),
                detail: message,
            },
        })
    }
}

/// Best-effort current commit for build metadata.
pub fn git_commit_hash() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!hash.is_empty()).then_some(hash)
}

fn register_payload(task: &dyn Task) -> RegisterTaskRequest {
    RegisterTaskRequest {
        task_id: task.id(),
        task_namespace: task.namespace(),
        task_name: task.name(),
        task_data: wire_document(task),
        version: task.version(),
        dependency_task_ids: task.requires().iter().map(|dep| dep.id()).collect(),
    }
}

#[async_trait]
impl Registry for ApiRegistry {
    async fn build_start(&self, root_tasks: &[TaskRef]) -> Result<String, RegistryClientError> {
        let body = CreateBuildRequest {
            description: None,
            commit_hash: git_commit_hash(),
            root_task_ids: root_tasks.iter().map(|task| task.id()).collect(),
        };
        let response = self
            .send(Method::POST, "/builds", &[], Some(serde_json::to_value(body).unwrap()))
            .await?;
        let response = self.expect_success(response, "create build").await?;
        let build: BuildResponse = response.json().await?;
        log::info!("started build {} ({})", build.name, build.id);
        Ok(build.id)
    }

    async fn build_complete(&self, build_id: &str) -> Result<(), RegistryClientError> {
        let response = self
            .send(Method::POST, &format!("/builds/{build_id}/complete"), &[], None)
            .await?;
        self.expect_success(response, "complete build").await?;
        Ok(())
    }

    async fn build_fail(
        &self,
        build_id: &str,
        error_message: Option<&str>,
    ) -> Result<(), RegistryClientError> {
        let mut query = Vec::new();
        if let Some(message) = error_message {
            query.push(("error_message", message.to_string()));
        }
        let response = self
            .send(Method::POST, &format!("/builds/{build_id}/fail"), &query, None)
            .await?;
        self.expect_success(response, "fail build").await?;
        Ok(())
    }

    async fn task_register(
        &self,
        build_id: &str,
        task: &dyn Task,
    ) -> Result<(), RegistryClientError> {
        let body = serde_json::to_value(register_payload(task)).unwrap();
        let response = self
            .send(Method::POST, &format!("/builds/{build_id}/tasks"), &[], Some(body))
            .await?;
        self.expect_success(response, "register task").await?;
        Ok(())
    }

    async fn task_start(
        &self,
        build_id: &str,
        task: &dyn Task,
    ) -> Result<(), RegistryClientError> {
        let path = format!("/builds/{build_id}/tasks/{}/start", task.id());
        let response = self.send(Method::POST, &path, &[], None).await?;
        self.expect_success(response, "start task").await?;
        Ok(())
    }

    async fn task_complete(
        &self,
        build_id: &str,
        task: &dyn Task,
    ) -> Result<(), RegistryClientError> {
        let path = format!("/builds/{build_id}/tasks/{}/complete", task.id());
        let response = self.send(Method::POST, &path, &[], None).await?;
        self.expect_success(response, "complete task").await?;
        Ok(())
    }

    async fn task_fail(
        &self,
        build_id: &str,
        task: &dyn Task,
        error_message: &str,
    ) -> Result<(), RegistryClientError> {
        let path = format!("/builds/{build_id}/tasks/{}/fail", task.id());
        let query = [("error_message", error_message.to_string())];
        let response = self.send(Method::POST, &path, &query, None).await?;
        self.expect_success(response, "fail task").await?;
        Ok(())
    }

    async fn task_upload_assets(
        &self,
        build_id: &str,
        task: &dyn Task,
        assets: Vec<AssetUpload>,
    ) -> Result<(), RegistryClientError> {
        let path = format!("/builds/{build_id}/tasks/{}/assets", task.id());
        let body = serde_json::to_value(UploadAssetsRequest { assets }).unwrap();
        let response = self.send(Method::POST, &path, &[], Some(body)).await?;
        self.expect_success(response, "upload assets").await?;
        Ok(())
    }

    async fn completed_task_ids(
        &self,
        build_id: &str,
    ) -> Result<HashSet<String>, RegistryClientError> {
        let response = self
            .send(Method::GET, &format!("/builds/{build_id}/tasks"), &[], None)
            .await?;
        let response = self.expect_success(response, "list build tasks").await?;
        let tasks: Vec<TaskWithStatusResponse> = response.json().await?;
        Ok(tasks
            .into_iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .map(|task| task.task.task_id)
            .collect())
    }
}

/// Lock manager speaking to `/locks`. One fresh owner id per build process
/// so every retry by this process is re-entrant.
pub struct ApiLockManager {
    registry: Arc<ApiRegistry>,
    owner_id: String,
    ttl_seconds: u64,
}

impl ApiLockManager {
    pub fn new(registry: Arc<ApiRegistry>, ttl_seconds: u64) -> Self {
        Self {
            registry,
            owner_id: uuid::Uuid::new_v4().to_string(),
            ttl_seconds,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

#[async_trait]
impl LockManager for ApiLockManager {
    async fn acquire(
        &self,
        name: &str,
        check_task_completion: bool,
    ) -> Result<LockAttempt, RegistryClientError> {
        let body = serde_json::to_value(LockAcquireRequest {
            owner_id: self.owner_id.clone(),
            ttl_seconds: self.ttl_seconds,
            check_task_completion,
        })
        .unwrap();
        let response = self
            .registry
            .send(Method::POST, &format!("/locks/{name}/acquire"), &[], Some(body))
            .await?;

        // 423 and 429 are refusals with a parseable body, not errors.
        let status = response.status();
        if status.is_success()
            || status == StatusCode::LOCKED
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            let result: LockAcquireResponse = response.json().await?;
            return Ok(match result.status {
                LockAcquireStatus::Acquired => LockAttempt::Acquired,
                LockAcquireStatus::AlreadyCompleted => LockAttempt::AlreadyCompleted,
                LockAcquireStatus::HeldByOther => LockAttempt::HeldByOther,
                LockAcquireStatus::ConcurrencyLimitReached => {
                    LockAttempt::ConcurrencyLimitReached
                }
            });
        }
        self.registry.expect_success(response, "acquire lock").await?;
        unreachable!("expect_success returns Err for non-success statuses")
    }

    async fn renew(&self, name: &str) -> Result<bool, RegistryClientError> {
        let body = serde_json::to_value(LockRenewRequest {
            owner_id: self.owner_id.clone(),
            ttl_seconds: self.ttl_seconds,
        })
        .unwrap();
        let response = self
            .registry
            .send(Method::POST, &format!("/locks/{name}/renew"), &[], Some(body))
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            _ => {
                self.registry.expect_success(response, "renew lock").await?;
                unreachable!("expect_success returns Err for non-success statuses")
            }
        }
    }

    async fn release(
        &self,
        name: &str,
        completed_build_id: Option<&str>,
    ) -> Result<bool, RegistryClientError> {
        let body = serde_json::to_value(LockReleaseRequest {
            owner_id: self.owner_id.clone(),
            completed_build_id: completed_build_id.map(str::to_string),
        })
        .unwrap();
        let response = self
            .registry
            .send(Method::POST, &format!("/locks/{name}/release"), &[], Some(body))
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            _ => {
                self.registry.expect_success(response, "release lock").await?;
                unreachable!("expect_success returns Err for non-success statuses")
            }
        }
    }

    fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }
}
