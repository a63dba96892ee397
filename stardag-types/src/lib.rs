pub mod auth;
pub mod build;
pub mod environment;
pub mod event;
pub mod lock;
pub mod search;
pub mod slug;
pub mod status;
pub mod task;
pub mod workspace;

pub use auth::{AuthConfigResponse, ExchangeRequest, ExchangeResponse, Role};
pub use build::{BuildListResponse, BuildResponse, CreateBuildRequest};
pub use environment::{
    ApiKeyCreatedResponse, ApiKeyResponse, CreateApiKeyRequest, CreateEnvironmentRequest,
    CreateTargetRootRequest, EnvironmentResponse, TargetRootResponse, UpdateTargetRootRequest,
};
pub use event::{EventResponse, EventType};
pub use lock::{
    LockAcquireRequest, LockAcquireStatus, LockAcquireResponse, LockCompletionStatusResponse,
    LockListResponse, LockReleaseRequest, LockRenewRequest, LockResponse,
};
pub use search::{
    AvailableColumnsResponse, KeySuggestion, KeySuggestionsResponse, TaskSearchResponse,
    TaskSearchResult, ValueSuggestion, ValueSuggestionsResponse,
};
pub use slug::validate_slug;
pub use status::{BuildStatus, TaskStatus};
pub use task::{
    AssetType, AssetUpload, GraphEdge, GraphNode, RegisterTaskRequest, RegistryAssetResponse,
    TaskGraphResponse, TaskListResponse, TaskResponse, TaskWithStatusResponse, UploadAssetsRequest,
};
pub use workspace::{
    CreateInviteRequest, CreateWorkspaceRequest, InviteResponse, InviteStatus, MeResponse,
    MemberResponse, UpdateMemberRequest, UpdateWorkspaceRequest, UserResponse, WorkspaceResponse,
    WorkspaceWithRole,
};
