//! OIDC token validation against the issuer's JWKS, with a TTL'd key cache.
//!
//! Keys are fetched lazily and refreshed when an unknown `kid` shows up or
//! the cache goes stale. A fetch failure falls back to previously cached
//! keys, so a flaky issuer does not take down authentication for tokens
//! signed with known keys.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::ServerConfig;
use crate::error::RegistryError;

const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct OidcClaims {
    pub sub: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

struct KeyCache {
    keys_by_kid: HashMap<String, DecodingKey>,
    last_refresh: Option<Instant>,
}

pub struct OidcValidator {
    issuer: String,
    audience: String,
    jwks_url: String,
    client: reqwest::Client,
    cache: RwLock<KeyCache>,
}

impl OidcValidator {
    pub fn new(config: &ServerConfig) -> Self {
        let jwks_url = format!(
            "{}/.well-known/jwks.json",
            config.oidc_issuer.trim_end_matches('/')
        );
        Self {
            issuer: config.oidc_issuer.clone(),
            audience: config.oidc_audience.clone(),
            jwks_url,
            client: reqwest::Client::new(),
            cache: RwLock::new(KeyCache {
                keys_by_kid: HashMap::new(),
                last_refresh: None,
            }),
        }
    }

    pub async fn validate(&self, token: &str) -> Result<OidcClaims, RegistryError> {
        let header = decode_header(token)
            .map_err(|e| RegistryError::Auth(format!("malformed token header: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| RegistryError::Auth("token missing key id (kid)".to_string()))?;

        let key = match self.cached_key(&kid).await {
            Some(key) => key,
            None => match self.refresh_keys().await {
                Ok(()) => self.any_key(&kid).await.ok_or_else(|| {
                    RegistryError::Auth(format!("no signing key for kid {kid}"))
                })?,
                // Issuer unreachable: fall back to whatever is cached, even
                // if stale, before giving up.
                Err(e) => self.any_key(&kid).await.ok_or(e)?,
            },
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);
        validation.validate_exp = true;

        match decode::<OidcClaims>(token, &key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) => {
                Err(RegistryError::TokenExpired)
            }
            Err(e) => Err(RegistryError::Auth(format!("invalid oidc token: {e}"))),
        }
    }

    async fn cached_key(&self, kid: &str) -> Option<DecodingKey> {
        let cache = self.cache.read().await;
        let stale = cache
            .last_refresh
            .map(|at| at.elapsed() > REFRESH_INTERVAL)
            .unwrap_or(true);
        if stale {
            return None;
        }
        cache.keys_by_kid.get(kid).cloned()
    }

    /// Cache lookup that ignores staleness.
    async fn any_key(&self, kid: &str) -> Option<DecodingKey> {
        self.cache.read().await.keys_by_kid.get(kid).cloned()
    }

    async fn refresh_keys(&self) -> Result<(), RegistryError> {
        let response = self
            .client
            .get(&self.jwks_url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.fetch_fallback(format!("jwks fetch: {e}")))?;

        if !response.status().is_success() {
            return Err(self.fetch_fallback(format!("jwks fetch status {}", response.status())));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| self.fetch_fallback(format!("jwks parse: {e}")))?;

        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            if let Some(kid) = jwk.common.key_id.as_ref() {
                if let Ok(key) = DecodingKey::from_jwk(jwk) {
                    keys.insert(kid.clone(), key);
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Merge so tokens signed with a rotated-out key keep validating
        // until the refresh interval passes.
        cache.keys_by_kid.extend(keys);
        cache.last_refresh = Some(Instant::now());
        log::debug!(
            "refreshed JWKS from {}: {} keys cached",
            self.jwks_url,
            cache.keys_by_kid.len()
        );
        Ok(())
    }

    fn fetch_fallback(&self, message: String) -> RegistryError {
        log::warn!("{message}; serving from cached JWKS if available");
        RegistryError::Upstream(message)
    }
}
