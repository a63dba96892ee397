//! Server configuration, read from the environment.

use std::path::PathBuf;

use base64::Engine;
use rand::RngCore;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub oidc_issuer: String,
    pub oidc_client_id: String,
    /// Expected `aud` claim on OIDC tokens; defaults to the client id.
    pub oidc_audience: String,
    /// HS256 secret for internal workspace tokens.
    pub internal_token_secret: String,
    pub internal_token_ttl_seconds: u64,
    /// Per-user cap on bootstrap workspace creation.
    pub max_workspaces_per_user: usize,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let oidc_client_id =
            std::env::var("STARDAG_OIDC_CLIENT_ID").unwrap_or_else(|_| "stardag".to_string());
        let oidc_audience =
            std::env::var("STARDAG_OIDC_AUDIENCE").unwrap_or_else(|_| oidc_client_id.clone());

        Self {
            bind_addr: std::env::var("STARDAG_REGISTRY_BIND")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            db_path: std::env::var("STARDAG_REGISTRY_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("stardag-registry.redb")),
            oidc_issuer: std::env::var("STARDAG_OIDC_ISSUER")
                .unwrap_or_else(|_| "https://accounts.example.com".to_string()),
            oidc_client_id,
            oidc_audience,
            internal_token_secret: std::env::var("STARDAG_INTERNAL_TOKEN_SECRET")
                .unwrap_or_else(|_| {
                    log::warn!(
                        "STARDAG_INTERNAL_TOKEN_SECRET not set; using an ephemeral secret \
                         (internal tokens will not survive a restart)"
                    );
                    random_secret()
                }),
            internal_token_ttl_seconds: std::env::var("STARDAG_INTERNAL_TOKEN_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            max_workspaces_per_user: std::env::var("STARDAG_MAX_WORKSPACES_PER_USER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
