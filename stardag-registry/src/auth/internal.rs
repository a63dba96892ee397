//! Internal workspace-scoped tokens, minted by the exchange endpoint and
//! accepted by all UI read/write routes.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

pub const INTERNAL_ISSUER: &str = "stardag-registry";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalClaims {
    /// Internal user id.
    pub sub: String,
    pub workspace_id: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

pub fn mint_internal_token(
    secret: &str,
    user_id: &str,
    workspace_id: &str,
    ttl_seconds: u64,
) -> Result<String, RegistryError> {
    let now = Utc::now().timestamp();
    let claims = InternalClaims {
        sub: user_id.to_string(),
        workspace_id: workspace_id.to_string(),
        iss: INTERNAL_ISSUER.to_string(),
        iat: now,
        exp: now + ttl_seconds as i64,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| RegistryError::Internal(format!("token mint: {e}")))
}

pub fn validate_internal_token(
    secret: &str,
    token: &str,
) -> Result<InternalClaims, RegistryError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[INTERNAL_ISSUER]);
    validation.validate_exp = true;

    match decode::<InternalClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => Ok(data.claims),
        Err(e) if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) => {
            Err(RegistryError::TokenExpired)
        }
        Err(e) => Err(RegistryError::Auth(format!("invalid internal token: {e}"))),
    }
}

/// Peek at an unverified JWT payload's `iss` claim so the extractors can
/// route a bearer token to internal or OIDC validation.
pub fn unverified_issuer(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::Engine::decode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        payload,
    )
    .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    value.get("iss")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_validate_roundtrip() {
        let token = mint_internal_token("secret", "user-1", "ws-1", 600).unwrap();
        let claims = validate_internal_token("secret", &token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.workspace_id, "ws-1");
        assert_eq!(claims.iss, INTERNAL_ISSUER);
        assert_eq!(unverified_issuer(&token).as_deref(), Some(INTERNAL_ISSUER));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = mint_internal_token("secret", "user-1", "ws-1", 600).unwrap();
        assert!(matches!(
            validate_internal_token("other", &token),
            Err(RegistryError::Auth(_))
        ));
    }

    #[test]
    fn expired_token_reports_distinctly() {
        let now = Utc::now().timestamp();
        let claims = InternalClaims {
            sub: "user-1".to_string(),
            workspace_id: "ws-1".to_string(),
            iss: INTERNAL_ISSUER.to_string(),
            iat: now - 1200,
            exp: now - 600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(
            validate_internal_token("secret", &token),
            Err(RegistryError::TokenExpired)
        ));
    }
}
