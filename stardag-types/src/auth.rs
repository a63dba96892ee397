use serde::{Deserialize, Serialize};

/// Organization role hierarchy: `member < admin < owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }
}

/// Advertised OIDC settings so CLI/UI can run the login flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfigResponse {
    pub oidc_issuer: String,
    pub oidc_client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub workspace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub access_token: String,
    /// Seconds until the minted internal token expires.
    pub expires_in: u64,
}
