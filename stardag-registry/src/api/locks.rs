//! Distributed lock routes. Acquire maps refusals to distinct status codes
//! (423 held elsewhere, 429 concurrency cap) so SDK backoff logic can react
//! without parsing bodies.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use stardag_types::{
    LockAcquireRequest, LockAcquireStatus, LockAcquireResponse, LockCompletionStatusResponse,
    LockListResponse, LockReleaseRequest, LockRenewRequest, LockResponse,
};

use crate::auth::SdkAuth;
use crate::error::RegistryError;

use super::AppState;

pub async fn acquire(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(name): Path<String>,
    Json(body): Json<LockAcquireRequest>,
) -> Result<(StatusCode, Json<LockAcquireResponse>), RegistryError> {
    let result = state.store.acquire_lock(
        &name,
        &body.owner_id,
        &auth.environment_id,
        body.ttl_seconds,
        body.check_task_completion,
    )?;

    let status_code = match result.status {
        LockAcquireStatus::Acquired | LockAcquireStatus::AlreadyCompleted => StatusCode::OK,
        LockAcquireStatus::HeldByOther => StatusCode::LOCKED,
        LockAcquireStatus::ConcurrencyLimitReached => StatusCode::TOO_MANY_REQUESTS,
    };

    Ok((
        status_code,
        Json(LockAcquireResponse {
            status: result.status,
            acquired: result.acquired(),
            lock: result.lock.map(|lock| lock.to_response()),
            error_message: result.error_message,
        }),
    ))
}

pub async fn renew(
    State(state): State<AppState>,
    _auth: SdkAuth,
    Path(name): Path<String>,
    Json(body): Json<LockRenewRequest>,
) -> Result<Json<LockResponse>, RegistryError> {
    match state
        .store
        .renew_lock(&name, &body.owner_id, body.ttl_seconds)?
    {
        Some(lock) => Ok(Json(lock.to_response())),
        None => Err(RegistryError::Conflict(
            "lock is not held by this owner".to_string(),
        )),
    }
}

pub async fn release(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(name): Path<String>,
    Json(body): Json<LockReleaseRequest>,
) -> Result<StatusCode, RegistryError> {
    let released = match &body.completed_build_id {
        Some(build_id) => state.store.release_lock_with_completion(
            &name,
            &body.owner_id,
            &auth.environment_id,
            build_id,
        )?,
        None => state.store.release_lock(&name, &body.owner_id)?,
    };

    if released {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RegistryError::Conflict(
            "lock is not held by this owner".to_string(),
        ))
    }
}

pub async fn get_lock(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(name): Path<String>,
) -> Result<Json<LockResponse>, RegistryError> {
    match state.store.get_lock(&name)? {
        Some(lock) if lock.environment_id == auth.environment_id => {
            Ok(Json(lock.to_response()))
        }
        _ => Err(RegistryError::NotFound("lock".to_string())),
    }
}

#[derive(Deserialize)]
pub struct ListLocksQuery {
    #[serde(default)]
    pub include_expired: bool,
}

pub async fn list_locks(
    State(state): State<AppState>,
    auth: SdkAuth,
    Query(query): Query<ListLocksQuery>,
) -> Result<Json<LockListResponse>, RegistryError> {
    let locks = state
        .store
        .list_locks(&auth.environment_id, query.include_expired)?
        .iter()
        .map(|lock| lock.to_response())
        .collect();
    Ok(Json(LockListResponse { locks }))
}

pub async fn completion_status(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(task_id): Path<String>,
) -> Result<Json<LockCompletionStatusResponse>, RegistryError> {
    let is_completed = state
        .store
        .task_completed_in_registry(&auth.environment_id, &task_id)?;
    Ok(Json(LockCompletionStatusResponse { is_completed }))
}
