//! Long-lived OIDC credentials per `(registry, user)`: the token endpoint,
//! client id and refresh token obtained from the device-code login.

use serde::{Deserialize, Serialize};

use crate::paths;
use crate::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub token_endpoint: String,
    pub client_id: String,
    pub refresh_token: String,
}

impl Credentials {
    pub fn load(registry: &str, user: &str) -> Result<Option<Self>, ConfigError> {
        let path = paths::credentials_file(registry, user);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, registry: &str, user: &str) -> Result<(), ConfigError> {
        let path = paths::credentials_file(registry, user);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn delete(registry: &str, user: &str) -> Result<bool, ConfigError> {
        let path = paths::credentials_file(registry, user);
        if path.exists() {
            std::fs::remove_file(path)?;
            return Ok(true);
        }
        Ok(false)
    }
}
