//! SDK build routes: build lifecycle, task registration and lifecycle
//! events, event listing and the per-build task graph.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use stardag_types::{
    BuildListResponse, BuildResponse, CreateBuildRequest, EventResponse, EventType,
    RegisterTaskRequest, RegistryAssetResponse, TaskGraphResponse, TaskWithStatusResponse,
    UploadAssetsRequest,
};

use crate::auth::SdkAuth;
use crate::error::RegistryError;
use crate::store::rows::{BuildRow, TaskRow};
use crate::store::status::TaskStatusInfo;
use crate::store::Store;

use super::AppState;

const MAX_PAGE_SIZE: u32 = 100;

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

pub(crate) fn default_page() -> u32 {
    1
}

pub(crate) fn default_page_size() -> u32 {
    50
}

impl PageQuery {
    pub fn clamped(&self) -> (u32, u32) {
        (self.page.max(1), self.page_size.clamp(1, MAX_PAGE_SIZE))
    }
}

#[derive(Deserialize)]
pub struct FailQuery {
    pub error_message: Option<String>,
}

/// Load a build and verify it belongs to the authenticated environment.
fn authorized_build(
    store: &Store,
    auth: &SdkAuth,
    build_id: &str,
) -> Result<BuildRow, RegistryError> {
    let build = store.get_build_row(build_id)?;
    if build.environment_id != auth.environment_id {
        return Err(RegistryError::Forbidden(
            "build does not belong to this environment".to_string(),
        ));
    }
    Ok(build)
}

fn build_response(store: &Store, build_id: &str) -> Result<BuildResponse, RegistryError> {
    let (row, status, started_at, completed_at) = store.build_status(build_id)?;
    Ok(row.to_response(status, started_at, completed_at))
}

fn task_with_status(task: &TaskRow, info: &TaskStatusInfo) -> TaskWithStatusResponse {
    TaskWithStatusResponse {
        task: task.to_response(),
        status: info.status(),
        started_at: info.started_at,
        completed_at: info.completed_at,
        error_message: info.error_message.clone(),
    }
}

pub async fn create_build(
    State(state): State<AppState>,
    auth: SdkAuth,
    Json(body): Json<CreateBuildRequest>,
) -> Result<(StatusCode, Json<BuildResponse>), RegistryError> {
    let row = state.store.create_build(
        &auth.environment_id,
        auth.principal_user_id.as_deref(),
        &body,
    )?;
    let response = build_response(&state.store, &row.id)?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn list_builds(
    State(state): State<AppState>,
    auth: SdkAuth,
    Query(page): Query<PageQuery>,
) -> Result<Json<BuildListResponse>, RegistryError> {
    let (page_num, page_size) = page.clamped();
    let (rows, total) =
        state
            .store
            .builds_in_env_page(&auth.environment_id, page_num, page_size)?;
    let mut builds = Vec::with_capacity(rows.len());
    for row in rows {
        builds.push(build_response(&state.store, &row.id)?);
    }
    Ok(Json(BuildListResponse {
        builds,
        total,
        page: page_num,
        page_size,
    }))
}

pub async fn get_build(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(build_id): Path<String>,
) -> Result<Json<BuildResponse>, RegistryError> {
    authorized_build(&state.store, &auth, &build_id)?;
    Ok(Json(build_response(&state.store, &build_id)?))
}

pub async fn complete_build(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(build_id): Path<String>,
) -> Result<Json<BuildResponse>, RegistryError> {
    authorized_build(&state.store, &auth, &build_id)?;
    state
        .store
        .append_build_event(&build_id, EventType::BuildCompleted, None)?;
    Ok(Json(build_response(&state.store, &build_id)?))
}

pub async fn fail_build(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(build_id): Path<String>,
    Query(query): Query<FailQuery>,
) -> Result<Json<BuildResponse>, RegistryError> {
    authorized_build(&state.store, &auth, &build_id)?;
    state
        .store
        .append_build_event(&build_id, EventType::BuildFailed, query.error_message)?;
    Ok(Json(build_response(&state.store, &build_id)?))
}

pub async fn register_task(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(build_id): Path<String>,
    Json(body): Json<RegisterTaskRequest>,
) -> Result<(StatusCode, Json<stardag_types::TaskResponse>), RegistryError> {
    authorized_build(&state.store, &auth, &build_id)?;
    let task = state.store.register_task(&build_id, &body)?;
    Ok((StatusCode::CREATED, Json(task.to_response())))
}

pub async fn list_build_tasks(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(build_id): Path<String>,
) -> Result<Json<Vec<TaskWithStatusResponse>>, RegistryError> {
    authorized_build(&state.store, &auth, &build_id)?;
    let tasks = state
        .store
        .tasks_in_build(&build_id)?
        .iter()
        .map(|(task, info)| task_with_status(task, info))
        .collect();
    Ok(Json(tasks))
}

async fn task_event(
    state: &AppState,
    auth: &SdkAuth,
    build_id: &str,
    task_id: &str,
    event_type: EventType,
    error_message: Option<String>,
) -> Result<Json<TaskWithStatusResponse>, RegistryError> {
    authorized_build(&state.store, auth, build_id)?;
    let (task, info) = state
        .store
        .append_task_event(build_id, task_id, event_type, error_message)?;
    Ok(Json(task_with_status(&task, &info)))
}

pub async fn start_task(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path((build_id, task_id)): Path<(String, String)>,
) -> Result<Json<TaskWithStatusResponse>, RegistryError> {
    task_event(&state, &auth, &build_id, &task_id, EventType::TaskStarted, None).await
}

pub async fn complete_task(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path((build_id, task_id)): Path<(String, String)>,
) -> Result<Json<TaskWithStatusResponse>, RegistryError> {
    task_event(
        &state,
        &auth,
        &build_id,
        &task_id,
        EventType::TaskCompleted,
        None,
    )
    .await
}

pub async fn fail_task(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path((build_id, task_id)): Path<(String, String)>,
    Query(query): Query<FailQuery>,
) -> Result<Json<TaskWithStatusResponse>, RegistryError> {
    task_event(
        &state,
        &auth,
        &build_id,
        &task_id,
        EventType::TaskFailed,
        query.error_message,
    )
    .await
}

pub async fn upload_assets(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path((build_id, task_id)): Path<(String, String)>,
    Json(body): Json<UploadAssetsRequest>,
) -> Result<(StatusCode, Json<Vec<RegistryAssetResponse>>), RegistryError> {
    authorized_build(&state.store, &auth, &build_id)?;
    let rows = state.store.upload_assets(&build_id, &task_id, &body.assets)?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(row.to_response()?);
    }
    Ok((StatusCode::CREATED, Json(out)))
}

pub async fn list_events(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(build_id): Path<String>,
) -> Result<Json<Vec<EventResponse>>, RegistryError> {
    authorized_build(&state.store, &auth, &build_id)?;
    let events = state.store.build_events(&build_id)?;
    let hashes = state.store.resolve_task_hashes(&events)?;
    let mut out = Vec::with_capacity(events.len());
    for event in &events {
        let task_hash = event.task_pk.and_then(|pk| hashes.get(&pk).cloned());
        out.push(event.to_response(task_hash)?);
    }
    Ok(Json(out))
}

pub async fn get_graph(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(build_id): Path<String>,
) -> Result<Json<TaskGraphResponse>, RegistryError> {
    authorized_build(&state.store, &auth, &build_id)?;
    Ok(Json(state.store.build_graph(&build_id)?))
}
