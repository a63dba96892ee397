//! Persistent row structs, bincode-encoded into redb tables.
//!
//! JSON payloads (task parameters, event metadata, asset bodies) are kept as
//! serialized strings inside rows so the encoding stays self-contained; they
//! are parsed back into `serde_json::Value` at the DTO boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stardag_types::{
    ApiKeyResponse, AssetType, BuildResponse, BuildStatus, EnvironmentResponse, EventResponse,
    EventType, InviteResponse, InviteStatus, LockResponse, RegistryAssetResponse, Role,
    TargetRootResponse, TaskResponse, UserResponse, WorkspaceResponse,
};

use crate::error::RegistryError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationRow {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    /// Stable subject from the OIDC issuer; None for seeded users.
    pub external_id: Option<String>,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserRow {
    pub fn to_response(&self) -> UserResponse {
        UserResponse {
            id: self.id.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRow {
    pub organization_id: String,
    pub user_id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRow {
    pub id: String,
    pub organization_id: String,
    pub email: String,
    pub role: Role,
    pub status: InviteStatus,
    pub invited_by: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl InviteRow {
    pub fn to_response(&self, workspace_id: String) -> InviteResponse {
        InviteResponse {
            id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            workspace_id,
            email: self.email.clone(),
            role: self.role,
            status: self.status,
            invited_by: self.invited_by.clone(),
            expires_at: self.expires_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRow {
    pub id: String,
    pub organization_id: String,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkspaceRow {
    pub fn to_response(&self) -> WorkspaceResponse {
        WorkspaceResponse {
            id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            slug: self.slug.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentRow {
    pub id: String,
    pub workspace_id: String,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub owner_user_id: Option<String>,
    pub max_concurrent_locks: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl EnvironmentRow {
    pub fn to_response(&self) -> EnvironmentResponse {
        EnvironmentResponse {
            id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            slug: self.slug.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            owner_user_id: self.owner_user_id.clone(),
            max_concurrent_locks: self.max_concurrent_locks,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRow {
    pub id: String,
    pub environment_id: String,
    pub name: String,
    pub key_prefix: String,
    /// `<salt-hex>$<sha256-hex>` over salt + full key.
    pub key_hash: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKeyRow {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    pub fn to_response(&self) -> ApiKeyResponse {
        ApiKeyResponse {
            id: self.id.clone(),
            environment_id: self.environment_id.clone(),
            name: self.name.clone(),
            key_prefix: self.key_prefix.clone(),
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            revoked_at: self.revoked_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRootRow {
    pub environment_id: String,
    pub name: String,
    pub uri: String,
}

impl TargetRootRow {
    pub fn to_response(&self) -> TargetRootResponse {
        TargetRootResponse {
            environment_id: self.environment_id.clone(),
            name: self.name.clone(),
            uri: self.uri.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRow {
    pub id: String,
    pub environment_id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub commit_hash: Option<String>,
    pub root_task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl BuildRow {
    pub fn to_response(
        &self,
        status: BuildStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> BuildResponse {
        BuildResponse {
            id: self.id.clone(),
            environment_id: self.environment_id.clone(),
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            commit_hash: self.commit_hash.clone(),
            root_task_ids: self.root_task_ids.clone(),
            created_at: self.created_at,
            status,
            started_at,
            completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub pk: u64,
    /// Content hash; unique within the environment.
    pub task_id: String,
    pub environment_id: String,
    pub task_namespace: String,
    pub task_name: String,
    /// Serialized JSON parameter blob, opaque to the registry.
    pub task_data: String,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskRow {
    pub fn task_data_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.task_data).unwrap_or(serde_json::Value::Null)
    }

    pub fn to_response(&self) -> TaskResponse {
        TaskResponse {
            task_id: self.task_id.clone(),
            environment_id: self.environment_id.clone(),
            task_namespace: self.task_namespace.clone(),
            task_name: self.task_name.clone(),
            task_data: self.task_data_value(),
            version: self.version.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub id: String,
    /// Global monotonic sequence; total order within a build.
    pub seq: u64,
    pub build_id: String,
    pub task_pk: Option<u64>,
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub metadata: Option<String>,
}

impl EventRow {
    pub fn to_response(&self, task_hash: Option<String>) -> Result<EventResponse, RegistryError> {
        let metadata = match &self.metadata {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        Ok(EventResponse {
            id: self.id.clone(),
            build_id: self.build_id.clone(),
            task_id: task_hash,
            event_type: self.event_type,
            created_at: self.created_at,
            error_message: self.error_message.clone(),
            metadata,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRow {
    pub name: String,
    pub environment_id: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

impl LockRow {
    /// Strict comparison: a lock whose lease ends exactly now is expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn to_response(&self) -> LockResponse {
        LockResponse {
            name: self.name.clone(),
            environment_id: self.environment_id.clone(),
            owner_id: self.owner_id.clone(),
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRow {
    pub id: String,
    pub task_pk: u64,
    pub asset_type: AssetType,
    pub name: String,
    /// Serialized JSON body.
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl AssetRow {
    pub fn to_response(&self) -> Result<RegistryAssetResponse, RegistryError> {
        Ok(RegistryAssetResponse {
            id: self.id.clone(),
            asset_type: self.asset_type,
            name: self.name.clone(),
            body: serde_json::from_str(&self.body)?,
            created_at: self.created_at,
        })
    }
}
