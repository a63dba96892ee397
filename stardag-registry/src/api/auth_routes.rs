//! `/auth/config` and the OIDC → internal token exchange.

use axum::extract::State;
use axum::Json;

use stardag_types::{AuthConfigResponse, ExchangeRequest, ExchangeResponse};

use crate::auth::{internal, OidcUser};
use crate::error::RegistryError;

use super::AppState;

pub async fn auth_config(State(state): State<AppState>) -> Json<AuthConfigResponse> {
    Json(AuthConfigResponse {
        oidc_issuer: state.config.oidc_issuer.clone(),
        oidc_client_id: state.config.oidc_client_id.clone(),
    })
}

/// Exchange a valid OIDC token for a short-lived internal token scoped to
/// one workspace. The caller must be a member of the workspace's
/// organization.
pub async fn exchange(
    State(state): State<AppState>,
    OidcUser(user): OidcUser,
    Json(body): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponse>, RegistryError> {
    let (_, role) = state.store.role_in_workspace(&body.workspace_id, &user.id)?;
    if role.is_none() {
        return Err(RegistryError::Forbidden(
            "not a member of this workspace".to_string(),
        ));
    }

    let ttl = state.config.internal_token_ttl_seconds;
    let access_token = internal::mint_internal_token(
        &state.config.internal_token_secret,
        &user.id,
        &body.workspace_id,
        ttl,
    )?;
    Ok(Json(ExchangeResponse {
        access_token,
        expires_in: ttl,
    }))
}
