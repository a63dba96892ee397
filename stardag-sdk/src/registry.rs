//! The build-tracking seam between the engine and the registry service.

use std::collections::HashSet;

use async_trait::async_trait;

use stardag_types::AssetUpload;

use crate::error::RegistryClientError;
use crate::task::{Task, TaskRef};

/// Build/task lifecycle reporting. The HTTP client implements this against
/// the registry API; tests use in-memory doubles.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Create a build and return its id. The registry appends
    /// BUILD_STARTED as part of creation.
    async fn build_start(&self, root_tasks: &[TaskRef]) -> Result<String, RegistryClientError>;

    async fn build_complete(&self, build_id: &str) -> Result<(), RegistryClientError>;

    async fn build_fail(
        &self,
        build_id: &str,
        error_message: Option<&str>,
    ) -> Result<(), RegistryClientError>;

    /// Register a task (idempotent per environment) and record TASK_PENDING
    /// for this build.
    async fn task_register(
        &self,
        build_id: &str,
        task: &dyn Task,
    ) -> Result<(), RegistryClientError>;

    async fn task_start(&self, build_id: &str, task: &dyn Task)
        -> Result<(), RegistryClientError>;

    async fn task_complete(
        &self,
        build_id: &str,
        task: &dyn Task,
    ) -> Result<(), RegistryClientError>;

    async fn task_fail(
        &self,
        build_id: &str,
        task: &dyn Task,
        error_message: &str,
    ) -> Result<(), RegistryClientError>;

    async fn task_upload_assets(
        &self,
        build_id: &str,
        task: &dyn Task,
        assets: Vec<AssetUpload>,
    ) -> Result<(), RegistryClientError>;

    /// Content hashes of tasks recorded completed in the build; used to
    /// seed the completion cache when resuming.
    async fn completed_task_ids(
        &self,
        build_id: &str,
    ) -> Result<HashSet<String>, RegistryClientError>;
}

/// Tracking disabled: every operation succeeds without effect. Builds get a
/// locally generated id so summaries stay meaningful.
#[derive(Debug, Default)]
pub struct NoopRegistry;

#[async_trait]
impl Registry for NoopRegistry {
    async fn build_start(&self, _root_tasks: &[TaskRef]) -> Result<String, RegistryClientError> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn build_complete(&self, _build_id: &str) -> Result<(), RegistryClientError> {
        Ok(())
    }

    async fn build_fail(
        &self,
        _build_id: &str,
        _error_message: Option<&str>,
    ) -> Result<(), RegistryClientError> {
        Ok(())
    }

    async fn task_register(
        &self,
        _build_id: &str,
        _task: &dyn Task,
    ) -> Result<(), RegistryClientError> {
        Ok(())
    }

    async fn task_start(
        &self,
        _build_id: &str,
        _task: &dyn Task,
    ) -> Result<(), RegistryClientError> {
        Ok(())
    }

    async fn task_complete(
        &self,
        _build_id: &str,
        _task: &dyn Task,
    ) -> Result<(), RegistryClientError> {
        Ok(())
    }

    async fn task_fail(
        &self,
        _build_id: &str,
        _task: &dyn Task,
        _error_message: &str,
    ) -> Result<(), RegistryClientError> {
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
        Ok(HashSet::new())
    }
}
