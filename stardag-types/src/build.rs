use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::BuildStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBuildRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    /// Content-hash ids of the root tasks of this build.
    #[serde(default)]
    pub root_task_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResponse {
    pub id: String,
    pub environment_id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub commit_hash: Option<String>,
    pub root_task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub status: BuildStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildListResponse {
    pub builds: Vec<BuildResponse>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}
