//! Credential resolution: three token shapes (OIDC, internal, API key)
//! normalized into request extractors.
//!
//! - `OidcUser` — bootstrap routes only; provisions the user on first sight.
//! - `InternalAuth` — workspace-scoped UI routes.
//! - `SdkAuth` — SDK routes; API key or internal token + `environment_id`.

pub mod api_key;
pub mod internal;
pub mod jwks;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use stardag_types::Role;

use crate::api::AppState;
use crate::error::RegistryError;
use crate::store::rows::UserRow;

pub use jwks::{OidcClaims, OidcValidator};

/// An OIDC-authenticated user (created or refreshed from the token claims).
pub struct OidcUser(pub UserRow);

/// A workspace-scoped internal token.
#[derive(Debug, Clone)]
pub struct InternalAuth {
    pub user_id: String,
    pub workspace_id: String,
}

/// The authorization tuple every SDK route resolves to.
#[derive(Debug, Clone)]
pub struct SdkAuth {
    pub environment_id: String,
    /// None for API-key calls whose key has no recorded creator.
    pub principal_user_id: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn presented_api_key(parts: &Parts) -> Option<String> {
    if let Some(key) = parts
        .headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        return Some(key.to_string());
    }
    bearer_token(parts).filter(|token| token.starts_with("sk_"))
}

fn query_param(parts: &Parts, name: &str) -> Option<String> {
    let query = parts.uri.query()?;
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == name {
                return Some(value.to_string());
            }
        }
    }
    None
}

async fn resolve_oidc_user(
    state: &AppState,
    token: &str,
) -> Result<UserRow, RegistryError> {
    let claims = state.oidc.validate(token).await?;
    let email = claims
        .email
        .as_deref()
        .ok_or_else(|| RegistryError::Auth("oidc token is missing the email claim".to_string()))?;
    state
        .store
        .get_or_create_oidc_user(&claims.sub, email, claims.name.as_deref())
}

#[async_trait]
impl FromRequestParts<AppState> for OidcUser {
    type Rejection = RegistryError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| RegistryError::Auth("missing bearer token".to_string()))?;
        if internal::unverified_issuer(&token).as_deref() == Some(internal::INTERNAL_ISSUER) {
            return Err(RegistryError::Auth(
                "this endpoint requires an OIDC token".to_string(),
            ));
        }
        let user = resolve_oidc_user(state, &token).await?;
        Ok(OidcUser(user))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for InternalAuth {
    type Rejection = RegistryError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| RegistryError::Auth("missing bearer token".to_string()))?;
        let claims =
            internal::validate_internal_token(&state.config.internal_token_secret, &token)?;
        Ok(InternalAuth {
            user_id: claims.sub,
            workspace_id: claims.workspace_id,
        })
    }
}

#[async_trait]
impl FromRequestParts<AppState> for SdkAuth {
    type Rejection = RegistryError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(key) = presented_api_key(parts) {
            let row = state.store.resolve_api_key(&key)?;
            return Ok(SdkAuth {
                environment_id: row.environment_id,
                principal_user_id: row.created_by,
            });
        }

        let token = bearer_token(parts)
            .ok_or_else(|| RegistryError::Auth("missing credentials".to_string()))?;
        let claims =
            internal::validate_internal_token(&state.config.internal_token_secret, &token)?;

        let environment_id = query_param(parts, "environment_id").ok_or_else(|| {
            RegistryError::Validation(
                "environment_id query parameter is required with token auth".to_string(),
            )
        })?;
        let env = state.store.get_environment(&environment_id)?;
        if env.workspace_id != claims.workspace_id {
            return Err(RegistryError::Forbidden(
                "environment does not belong to this workspace".to_string(),
            ));
        }

        Ok(SdkAuth {
            environment_id,
            principal_user_id: Some(claims.sub),
        })
    }
}

/// Either credential shape accepted on the dual UI/OIDC routes
/// (invite accept/decline, `/ui/me`-style bootstrap).
pub enum UiPrincipal {
    Oidc(UserRow),
    Internal(InternalAuth),
}

#[async_trait]
impl FromRequestParts<AppState> for UiPrincipal {
    type Rejection = RegistryError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| RegistryError::Auth("missing bearer token".to_string()))?;
        if internal::unverified_issuer(&token).as_deref() == Some(internal::INTERNAL_ISSUER) {
            let claims =
                internal::validate_internal_token(&state.config.internal_token_secret, &token)?;
            Ok(UiPrincipal::Internal(InternalAuth {
                user_id: claims.sub,
                workspace_id: claims.workspace_id,
            }))
        } else {
            let user = resolve_oidc_user(state, &token).await?;
            Ok(UiPrincipal::Oidc(user))
        }
    }
}

impl UiPrincipal {
    pub fn user_id(&self) -> &str {
        match self {
            UiPrincipal::Oidc(user) => &user.id,
            UiPrincipal::Internal(auth) => &auth.user_id,
        }
    }
}

/// Require the caller to hold at least `required` in the workspace's
/// organization; returns the resolved role.
pub fn require_workspace_role(
    state: &AppState,
    workspace_id: &str,
    user_id: &str,
    required: Role,
) -> Result<Role, RegistryError> {
    let (_, role) = state.store.role_in_workspace(workspace_id, user_id)?;
    let role = role.ok_or_else(|| {
        RegistryError::Forbidden("not a member of this workspace".to_string())
    })?;
    if role < required {
        return Err(RegistryError::Forbidden(format!(
            "requires {} role or above",
            required.as_str()
        )));
    }
    Ok(role)
}
