use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle event types recorded against a build's append-only stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    BuildStarted,
    BuildCompleted,
    BuildFailed,
    TaskPending,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
}

impl EventType {
    pub fn is_build_scoped(&self) -> bool {
        matches!(
            self,
            EventType::BuildStarted | EventType::BuildCompleted | EventType::BuildFailed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub id: String,
    pub build_id: String,
    /// Content-hash id of the task this event refers to; None for build-scoped events.
    pub task_id: Option<String>,
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}
