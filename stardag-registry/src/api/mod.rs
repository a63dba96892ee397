//! Versioned HTTP surface. Stateless: all state lives in the store; the
//! only process-wide caches are the JWKS keys and search suggestions.

mod auth_routes;
mod builds;
mod locks;
mod tasks;
mod ui;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;

use crate::auth::OidcValidator;
use crate::config::ServerConfig;
use crate::error::RegistryError;
use crate::store::{Store, SuggestionCache};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<ServerConfig>,
    pub oidc: Arc<OidcValidator>,
    pub suggestions: Arc<SuggestionCache>,
}

impl AppState {
    pub fn new(store: Store, config: ServerConfig) -> Self {
        let oidc = Arc::new(OidcValidator::new(&config));
        Self {
            store,
            config: Arc::new(config),
            oidc,
            suggestions: Arc::new(SuggestionCache::default()),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        // Auth bootstrap.
        .route("/auth/config", get(auth_routes::auth_config))
        .route("/auth/exchange", post(auth_routes::exchange))
        // UI surface.
        .route("/ui/me", get(ui::me))
        .route("/ui/me/invites", get(ui::my_invites))
        .route("/ui/workspaces", post(ui::create_workspace))
        .route(
            "/ui/workspaces/:workspace_id",
            get(ui::get_workspace)
                .patch(ui::update_workspace)
                .delete(ui::delete_workspace),
        )
        .route(
            "/ui/workspaces/:workspace_id/members",
            get(ui::list_members)
                .patch(ui::update_member)
                .delete(ui::remove_member),
        )
        .route(
            "/ui/workspaces/:workspace_id/invites",
            get(ui::list_invites).post(ui::create_invite),
        )
        .route(
            "/ui/workspaces/:workspace_id/invites/:invite_id",
            delete(ui::cancel_invite),
        )
        .route(
            "/ui/workspaces/:workspace_id/invites/:invite_id/accept",
            post(ui::accept_invite),
        )
        .route(
            "/ui/workspaces/:workspace_id/invites/:invite_id/decline",
            post(ui::decline_invite),
        )
        .route(
            "/ui/workspaces/:workspace_id/environments",
            get(ui::list_environments).post(ui::create_environment),
        )
        .route(
            "/ui/workspaces/:workspace_id/environments/:environment_id",
            delete(ui::delete_environment),
        )
        .route(
            "/ui/workspaces/:workspace_id/environments/:environment_id/api-keys",
            get(ui::list_api_keys).post(ui::create_api_key),
        )
        .route(
            "/ui/workspaces/:workspace_id/environments/:environment_id/api-keys/:key_id",
            delete(ui::revoke_api_key),
        )
        .route(
            "/ui/workspaces/:workspace_id/environments/:environment_id/target-roots",
            get(ui::list_target_roots)
                .post(ui::create_target_root)
                .patch(ui::update_target_root),
        )
        .route(
            "/ui/workspaces/:workspace_id/environments/:environment_id/target-roots/:name",
            delete(ui::delete_target_root),
        )
        // SDK surface: builds and their event streams.
        .route("/builds", post(builds::create_build).get(builds::list_builds))
        .route("/builds/:build_id", get(builds::get_build))
        .route("/builds/:build_id/complete", post(builds::complete_build))
        .route("/builds/:build_id/fail", post(builds::fail_build))
        .route(
            "/builds/:build_id/tasks",
            post(builds::register_task).get(builds::list_build_tasks),
        )
        .route(
            "/builds/:build_id/tasks/:task_id/start",
            post(builds::start_task),
        )
        .route(
            "/builds/:build_id/tasks/:task_id/complete",
            post(builds::complete_task),
        )
        .route(
            "/builds/:build_id/tasks/:task_id/fail",
            post(builds::fail_task),
        )
        .route(
            "/builds/:build_id/tasks/:task_id/assets",
            post(builds::upload_assets),
        )
        .route("/builds/:build_id/events", get(builds::list_events))
        .route("/builds/:build_id/graph", get(builds::get_graph))
        // SDK surface: tasks and search.
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/search", get(tasks::search))
        .route("/tasks/search/keys", get(tasks::search_keys))
        .route("/tasks/search/values", get(tasks::search_values))
        .route("/tasks/search/columns", get(tasks::search_columns))
        .route("/tasks/:task_id/assets", get(tasks::list_assets))
        // SDK surface: distributed locks.
        .route("/locks", get(locks::list_locks))
        .route("/locks/:name", get(locks::get_lock))
        .route("/locks/:name/acquire", post(locks::acquire))
        .route("/locks/:name/renew", post(locks::renew))
        .route("/locks/:name/release", post(locks::release))
        .route(
            "/locks/tasks/:task_id/completion-status",
            get(locks::completion_status),
        );

    Router::new().nest("/api/v1", api).with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn serve(state: AppState) -> Result<(), RegistryError> {
    let bind_addr = state.config.bind_addr.clone();
    let router = app(state);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| RegistryError::Internal(format!("bind {bind_addr}: {e}")))?;
    log::info!("registry listening on {bind_addr}");
    axum::serve(listener, router)
        .await
        .map_err(|e| RegistryError::Internal(format!("serve: {e}")))
}
