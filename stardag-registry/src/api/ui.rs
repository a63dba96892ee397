//! Workspace-facing UI routes: membership, invites, environments, API keys
//! and target roots.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use stardag_types::{
    ApiKeyCreatedResponse, ApiKeyResponse, CreateApiKeyRequest, CreateEnvironmentRequest,
    CreateInviteRequest, CreateTargetRootRequest, CreateWorkspaceRequest, EnvironmentResponse,
    InviteResponse, MeResponse, MemberResponse, Role, TargetRootResponse, UpdateMemberRequest,
    UpdateTargetRootRequest, UpdateWorkspaceRequest, WorkspaceResponse, WorkspaceWithRole,
};

use crate::auth::{require_workspace_role, InternalAuth, OidcUser, UiPrincipal};
use crate::error::RegistryError;

use super::AppState;

fn check_token_scope(auth: &InternalAuth, workspace_id: &str) -> Result<(), RegistryError> {
    if auth.workspace_id != workspace_id {
        return Err(RegistryError::Forbidden(
            "token is scoped to a different workspace".to_string(),
        ));
    }
    Ok(())
}

/// Environment route guard: membership in the workspace plus the
/// environment actually belonging to it.
fn check_environment(
    state: &AppState,
    auth: &InternalAuth,
    workspace_id: &str,
    environment_id: &str,
    required: Role,
) -> Result<(), RegistryError> {
    check_token_scope(auth, workspace_id)?;
    require_workspace_role(state, workspace_id, &auth.user_id, required)?;
    let env = state.store.get_environment(environment_id)?;
    if env.workspace_id != workspace_id {
        return Err(RegistryError::NotFound("environment".to_string()));
    }
    Ok(())
}

pub async fn me(
    State(state): State<AppState>,
    principal: UiPrincipal,
) -> Result<Json<MeResponse>, RegistryError> {
    let user = match &principal {
        UiPrincipal::Oidc(user) => user.clone(),
        UiPrincipal::Internal(auth) => state.store.get_user(&auth.user_id)?,
    };
    let workspaces = state
        .store
        .workspaces_for_user(&user.id)?
        .into_iter()
        .map(|(workspace, role)| WorkspaceWithRole {
            workspace: workspace.to_response(),
            role,
        })
        .collect();
    Ok(Json(MeResponse {
        user: user.to_response(),
        workspaces,
    }))
}

pub async fn my_invites(
    State(state): State<AppState>,
    OidcUser(user): OidcUser,
) -> Result<Json<Vec<InviteResponse>>, RegistryError> {
    let invites = state.store.pending_invites_for_email(&user.email)?;
    let mut out = Vec::new();
    for invite in invites {
        let workspace_id = state
            .store
            .workspaces_of_org(&invite.organization_id)?
            .first()
            .map(|w| w.id.clone())
            .unwrap_or_default();
        out.push(invite.to_response(workspace_id));
    }
    Ok(Json(out))
}

pub async fn create_workspace(
    State(state): State<AppState>,
    OidcUser(user): OidcUser,
    Json(body): Json<CreateWorkspaceRequest>,
) -> Result<(StatusCode, Json<WorkspaceResponse>), RegistryError> {
    let workspace =
        state
            .store
            .create_workspace(&user, &body, state.config.max_workspaces_per_user)?;
    Ok((StatusCode::CREATED, Json(workspace.to_response())))
}

pub async fn get_workspace(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path(workspace_id): Path<String>,
) -> Result<Json<WorkspaceResponse>, RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Member)?;
    let workspace = state.store.get_workspace(&workspace_id)?;
    Ok(Json(workspace.to_response()))
}

pub async fn update_workspace(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path(workspace_id): Path<String>,
    Json(body): Json<UpdateWorkspaceRequest>,
) -> Result<Json<WorkspaceResponse>, RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Admin)?;
    let workspace = state.store.update_workspace(&workspace_id, &body)?;
    Ok(Json(workspace.to_response()))
}

pub async fn delete_workspace(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path(workspace_id): Path<String>,
) -> Result<StatusCode, RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Owner)?;
    state.store.delete_workspace(&workspace_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_members(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path(workspace_id): Path<String>,
) -> Result<Json<Vec<MemberResponse>>, RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Member)?;
    let workspace = state.store.get_workspace(&workspace_id)?;
    Ok(Json(state.store.list_members(&workspace.organization_id)?))
}

pub async fn update_member(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path(workspace_id): Path<String>,
    Json(body): Json<UpdateMemberRequest>,
) -> Result<StatusCode, RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Admin)?;
    let workspace = state.store.get_workspace(&workspace_id)?;
    state
        .store
        .update_member_role(&workspace.organization_id, &body.user_id, body.role)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
pub struct UserIdQuery {
    user_id: String,
}

pub async fn remove_member(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path(workspace_id): Path<String>,
    Query(query): Query<UserIdQuery>,
) -> Result<StatusCode, RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Admin)?;
    let workspace = state.store.get_workspace(&workspace_id)?;
    state
        .store
        .remove_member(&workspace.organization_id, &query.user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_invites(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path(workspace_id): Path<String>,
) -> Result<Json<Vec<InviteResponse>>, RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Member)?;
    let workspace = state.store.get_workspace(&workspace_id)?;
    let invites = state
        .store
        .list_invites(&workspace.organization_id)?
        .into_iter()
        .map(|invite| invite.to_response(workspace_id.clone()))
        .collect();
    Ok(Json(invites))
}

pub async fn create_invite(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path(workspace_id): Path<String>,
    Json(body): Json<CreateInviteRequest>,
) -> Result<(StatusCode, Json<InviteResponse>), RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Admin)?;
    let workspace = state.store.get_workspace(&workspace_id)?;
    let invite = state.store.create_invite(
        &workspace.organization_id,
        &body.email,
        body.role,
        &auth.user_id,
    )?;
    Ok((StatusCode::CREATED, Json(invite.to_response(workspace_id))))
}

pub async fn cancel_invite(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path((workspace_id, invite_id)): Path<(String, String)>,
) -> Result<StatusCode, RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Admin)?;
    let workspace = state.store.get_workspace(&workspace_id)?;
    let invite = state.store.get_invite(&invite_id)?;
    if invite.organization_id != workspace.organization_id {
        return Err(RegistryError::NotFound("invite".to_string()));
    }
    state.store.cancel_invite(&invite_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn accept_invite(
    State(state): State<AppState>,
    OidcUser(user): OidcUser,
    Path((_workspace_id, invite_id)): Path<(String, String)>,
) -> Result<StatusCode, RegistryError> {
    state.store.accept_invite(&invite_id, &user)?;
    Ok(StatusCode::OK)
}

pub async fn decline_invite(
    State(state): State<AppState>,
    OidcUser(user): OidcUser,
    Path((_workspace_id, invite_id)): Path<(String, String)>,
) -> Result<StatusCode, RegistryError> {
    state.store.decline_invite(&invite_id, &user)?;
    Ok(StatusCode::OK)
}

pub async fn list_environments(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path(workspace_id): Path<String>,
) -> Result<Json<Vec<EnvironmentResponse>>, RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Member)?;
    let environments = state
        .store
        .list_environments(&workspace_id)?
        .iter()
        .map(|env| env.to_response())
        .collect();
    Ok(Json(environments))
}

pub async fn create_environment(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path(workspace_id): Path<String>,
    Json(body): Json<CreateEnvironmentRequest>,
) -> Result<(StatusCode, Json<EnvironmentResponse>), RegistryError> {
    check_token_scope(&auth, &workspace_id)?;
    require_workspace_role(&state, &workspace_id, &auth.user_id, Role::Admin)?;
    let env = state.store.create_environment(&workspace_id, &body)?;
    Ok((StatusCode::CREATED, Json(env.to_response())))
}

pub async fn delete_environment(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path((workspace_id, environment_id)): Path<(String, String)>,
) -> Result<StatusCode, RegistryError> {
    check_environment(&state, &auth, &workspace_id, &environment_id, Role::Admin)?;
    state.store.delete_environment(&environment_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path((workspace_id, environment_id)): Path<(String, String)>,
) -> Result<Json<Vec<ApiKeyResponse>>, RegistryError> {
    check_environment(&state, &auth, &workspace_id, &environment_id, Role::Member)?;
    let keys = state
        .store
        .list_api_keys(&environment_id)?
        .iter()
        .map(|key| key.to_response())
        .collect();
    Ok(Json(keys))
}

pub async fn create_api_key(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path((workspace_id, environment_id)): Path<(String, String)>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<ApiKeyCreatedResponse>), RegistryError> {
    check_environment(&state, &auth, &workspace_id, &environment_id, Role::Admin)?;
    let (row, key) = state
        .store
        .create_api_key(&environment_id, &body.name, Some(&auth.user_id))?;
    Ok((
        StatusCode::CREATED,
        Json(ApiKeyCreatedResponse {
            metadata: row.to_response(),
            key,
        }),
    ))
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path((workspace_id, environment_id, key_id)): Path<(String, String, String)>,
) -> Result<StatusCode, RegistryError> {
    check_environment(&state, &auth, &workspace_id, &environment_id, Role::Admin)?;
    state.store.revoke_api_key(&environment_id, &key_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_target_roots(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path((workspace_id, environment_id)): Path<(String, String)>,
) -> Result<Json<Vec<TargetRootResponse>>, RegistryError> {
    check_environment(&state, &auth, &workspace_id, &environment_id, Role::Member)?;
    let roots = state
        .store
        .list_target_roots(&environment_id)?
        .iter()
        .map(|root| root.to_response())
        .collect();
    Ok(Json(roots))
}

pub async fn create_target_root(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path((workspace_id, environment_id)): Path<(String, String)>,
    Json(body): Json<CreateTargetRootRequest>,
) -> Result<(StatusCode, Json<TargetRootResponse>), RegistryError> {
    check_environment(&state, &auth, &workspace_id, &environment_id, Role::Member)?;
    let root = state
        .store
        .create_target_root(&environment_id, &body.name, &body.uri)?;
    Ok((StatusCode::CREATED, Json(root.to_response())))
}

pub async fn update_target_root(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path((workspace_id, environment_id)): Path<(String, String)>,
    Json(body): Json<UpdateTargetRootRequest>,
) -> Result<Json<TargetRootResponse>, RegistryError> {
    check_environment(&state, &auth, &workspace_id, &environment_id, Role::Member)?;
    let root = state
        .store
        .update_target_root(&environment_id, &body.name, &body.uri)?;
    Ok(Json(root.to_response()))
}

pub async fn delete_target_root(
    State(state): State<AppState>,
    auth: InternalAuth,
    Path((workspace_id, environment_id, name)): Path<(String, String, String)>,
) -> Result<StatusCode, RegistryError> {
    check_environment(&state, &auth, &workspace_id, &environment_id, Role::Member)?;
    state.store.delete_target_root(&environment_id, &name)?;
    Ok(StatusCode::NO_CONTENT)
}
