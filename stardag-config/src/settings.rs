//! Merged client settings: environment variables win over the active
//! profile; `STARDAG_API_KEY` bypasses profile credentials entirely.

use std::time::Duration;

use crate::config::ConfigFile;
use crate::token_cache::CachedAccessToken;
use crate::ConfigError;

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub registry_url: Option<String>,
    pub registry_name: Option<String>,
    pub api_key: Option<String>,
    pub workspace_id: Option<String>,
    pub environment_id: Option<String>,
    pub user: Option<String>,
    /// Fresh cached internal token for `(registry, user, workspace)`.
    pub access_token: Option<String>,
    pub timeout: Duration,
}

impl ClientSettings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigFile::load()?;
        let profile = config.active_profile();

        let registry_name = profile.as_ref().map(|(_, p)| p.registry.clone());
        let profile_url =
            profile.as_ref().and_then(|(_, p)| config.registry_url(p));
        let registry_url = std::env::var("STARDAG_REGISTRY_URL").ok().or(profile_url);

        let api_key = std::env::var("STARDAG_API_KEY").ok();
        let workspace_id = std::env::var("STARDAG_WORKSPACE_ID")
            .ok()
            .or_else(|| profile.as_ref().and_then(|(_, p)| p.workspace_id.clone()));
        let environment_id = std::env::var("STARDAG_ENVIRONMENT_ID")
            .ok()
            .or_else(|| profile.as_ref().and_then(|(_, p)| p.environment_id.clone()));
        let user = profile.as_ref().and_then(|(_, p)| p.user.clone());

        // Only consult the token cache when not using an API key.
        let access_token = if api_key.is_none() {
            match (&registry_name, &user, &workspace_id) {
                (Some(registry), Some(user), Some(workspace)) => {
                    CachedAccessToken::load(registry, user, workspace)?
                        .filter(CachedAccessToken::is_fresh)
                        .map(|cached| cached.access_token)
                }
                _ => None,
            }
        } else {
            None
        };

        let timeout = std::env::var("STARDAG_API_TIMEOUT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS));

        Ok(Self {
            registry_url,
            registry_name,
            api_key,
            workspace_id,
            environment_id,
            user,
            access_token,
            timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Profile, RegistryEntry};

    fn with_home<T>(f: impl FnOnce(&std::path::Path) -> T) -> T {
        let _guard = crate::TEST_ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("STARDAG_HOME", dir.path());
        let result = f(dir.path());
        std::env::remove_var("STARDAG_HOME");
        result
    }

    #[test]
    fn env_overrides_beat_profile_values() {
        with_home(|_| {
            let mut config = ConfigFile::default();
            config.registries.insert(
                "local".to_string(),
                RegistryEntry {
                    url: "http://localhost:8080".to_string(),
                },
            );
            config.profiles.insert(
                "dev".to_string(),
                Profile {
                    registry: "local".to_string(),
                    workspace_id: Some("ws-profile".to_string()),
                    environment_id: Some("env-profile".to_string()),
                    user: None,
                },
            );
            config.default_profile = Some("dev".to_string());
            config.save().unwrap();

            std::env::set_var("STARDAG_ENVIRONMENT_ID", "env-override");
            let settings = ClientSettings::load().unwrap();
            std::env::remove_var("STARDAG_ENVIRONMENT_ID");

            assert_eq!(
                settings.registry_url.as_deref(),
                Some("http://localhost:8080")
            );
            assert_eq!(settings.workspace_id.as_deref(), Some("ws-profile"));
            assert_eq!(settings.environment_id.as_deref(), Some("env-override"));
        });
    }

    #[test]
    fn missing_config_yields_empty_settings() {
        with_home(|_| {
            let settings = ClientSettings::load().unwrap();
            assert!(settings.registry_url.is_none());
            assert!(settings.access_token.is_none());
        });
    }
}
