//! Cached internal access tokens per `(registry, user, workspace)`,
//! written after each exchange and reused until shortly before expiry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::paths;
use crate::ConfigError;

/// Refuse tokens this close to expiry so in-flight requests don't race it.
const EXPIRY_MARGIN_SECONDS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedAccessToken {
    pub fn is_fresh(&self) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECONDS) > Utc::now()
    }

    pub fn load(
        registry: &str,
        user: &str,
        workspace_id: &str,
    ) -> Result<Option<Self>, ConfigError> {
        let path = paths::access_token_cache_file(registry, user, workspace_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(
        &self,
        registry: &str,
        user: &str,
        workspace_id: &str,
    ) -> Result<(), ConfigError> {
        let path = paths::access_token_cache_file(registry, user, workspace_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn delete(registry: &str, user: &str, workspace_id: &str) -> Result<bool, ConfigError> {
        let path = paths::access_token_cache_file(registry, user, workspace_id);
        if path.exists() {
            std::fs::remove_file(path)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_honors_the_margin() {
        let fresh = CachedAccessToken {
            access_token: "t".to_string(),
            expires_at: Utc::now() + Duration::seconds(120),
        };
        assert!(fresh.is_fresh());

        let nearly_expired = CachedAccessToken {
            access_token: "t".to_string(),
            expires_at: Utc::now() + Duration::seconds(10),
        };
        assert!(!nearly_expired.is_fresh());
    }
}
