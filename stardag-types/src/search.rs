use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::TaskStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSearchResult {
    pub task_id: String,
    pub environment_id: String,
    pub task_namespace: String,
    pub task_name: String,
    pub task_data: serde_json::Value,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Build context from the task's most recent event, if any.
    pub build_id: Option<String>,
    pub build_name: Option<String>,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub asset_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSearchResponse {
    pub tasks: Vec<TaskSearchResult>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub available_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySuggestion {
    pub key: String,
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySuggestionsResponse {
    pub keys: Vec<KeySuggestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueSuggestion {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueSuggestionsResponse {
    pub values: Vec<ValueSuggestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableColumnsResponse {
    pub core: Vec<String>,
    pub params: Vec<String>,
    pub assets: Vec<String>,
}
