use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::TaskStatus;

/// Payload for registering a task against a build. Registration is
/// idempotent per `(environment, task_id)`; re-registration reuses the
/// stored row and only appends a TASK_PENDING event for the build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterTaskRequest {
    pub task_id: String,
    pub task_namespace: String,
    pub task_name: String,
    /// Serialized task parameters; opaque to the registry.
    pub task_data: serde_json::Value,
    #[serde(default)]
    pub version: Option<String>,
    /// Content-hash ids of tasks this task depends on.
    #[serde(default)]
    pub dependency_task_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub environment_id: String,
    pub task_namespace: String,
    pub task_name: String,
    pub task_data: serde_json::Value,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWithStatusResponse {
    #[serde(flatten)]
    pub task: TaskResponse,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub task_id: String,
    pub task_namespace: String,
    pub task_name: String,
    pub status: TaskStatus,
}

/// Directed edge `upstream -> downstream` between two task content hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub upstream: String,
    pub downstream: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraphResponse {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Markdown,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAssetsRequest {
    pub assets: Vec<AssetUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetUpload {
    pub asset_type: AssetType,
    pub name: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAssetResponse {
    pub id: String,
    pub asset_type: AssetType,
    pub name: String,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
