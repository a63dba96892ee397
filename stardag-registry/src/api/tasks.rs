//! SDK task routes: environment task listing, asset retrieval, search and
//! autocomplete.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use stardag_types::{
    AvailableColumnsResponse, KeySuggestionsResponse, RegistryAssetResponse, TaskListResponse,
    TaskSearchResponse, ValueSuggestionsResponse,
};

use crate::auth::SdkAuth;
use crate::error::RegistryError;

use super::builds::PageQuery;
use super::AppState;

pub async fn list_tasks(
    State(state): State<AppState>,
    auth: SdkAuth,
    Query(page): Query<PageQuery>,
) -> Result<Json<TaskListResponse>, RegistryError> {
    let (page_num, page_size) = page.clamped();
    let (rows, total) =
        state
            .store
            .tasks_in_env_page(&auth.environment_id, page_num, page_size)?;
    Ok(Json(TaskListResponse {
        tasks: rows.iter().map(|row| row.to_response()).collect(),
        total,
        page: page_num,
        page_size,
    }))
}

pub async fn list_assets(
    State(state): State<AppState>,
    auth: SdkAuth,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<RegistryAssetResponse>>, RegistryError> {
    let rows = state.store.list_assets(&auth.environment_id, &task_id)?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(row.to_response()?);
    }
    Ok(Json(out))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default = "super::builds::default_page")]
    pub page: u32,
    #[serde(default = "super::builds::default_page_size")]
    pub page_size: u32,
    pub filter: Option<String>,
    pub q: Option<String>,
    #[serde(default = "default_sort")]
    pub sort: String,
}

fn default_sort() -> String {
    "created_at:desc".to_string()
}

pub async fn search(
    State(state): State<AppState>,
    auth: SdkAuth,
    Query(query): Query<SearchQuery>,
) -> Result<Json<TaskSearchResponse>, RegistryError> {
    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, 100);
    let response = state.store.search_tasks(
        &auth.environment_id,
        query.filter.as_deref(),
        query.q.as_deref(),
        &query.sort,
        page,
        page_size,
    )?;
    Ok(Json(response))
}

#[derive(Deserialize)]
pub struct KeysQuery {
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_suggestion_limit")]
    pub limit: usize,
}

fn default_suggestion_limit() -> usize {
    20
}

pub async fn search_keys(
    State(state): State<AppState>,
    auth: SdkAuth,
    Query(query): Query<KeysQuery>,
) -> Result<Json<KeySuggestionsResponse>, RegistryError> {
    let response = state.store.key_suggestions(
        &state.suggestions,
        &auth.environment_id,
        &query.prefix,
        query.limit,
    )?;
    Ok(Json(response))
}

#[derive(Deserialize)]
pub struct ValuesQuery {
    pub key: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_suggestion_limit")]
    pub limit: usize,
}

pub async fn search_values(
    State(state): State<AppState>,
    auth: SdkAuth,
    Query(query): Query<ValuesQuery>,
) -> Result<Json<ValueSuggestionsResponse>, RegistryError> {
    let response = state.store.value_suggestions(
        &state.suggestions,
        &auth.environment_id,
        &query.key,
        &query.prefix,
        query.limit,
    )?;
    Ok(Json(response))
}

pub async fn search_columns(
    State(state): State<AppState>,
    auth: SdkAuth,
) -> Result<Json<AvailableColumnsResponse>, RegistryError> {
    Ok(Json(state.store.available_columns(&auth.environment_id)?))
}
