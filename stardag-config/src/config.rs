//! `config.toml`: known registries, profiles and the default profile.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::paths;
use crate::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Name of a registry in `[registries]`.
    pub registry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    /// The logged-in user this profile authenticates as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
    #[serde(default)]
    pub registries: BTreeMap<String, RegistryEntry>,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl ConfigFile {
    /// Load the config file; a missing file is an empty config.
    pub fn load() -> Result<Self, ConfigError> {
        let path = paths::config_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = paths::config_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn registry_url(&self, profile: &Profile) -> Option<String> {
        self.registries
            .get(&profile.registry)
            .map(|entry| entry.url.clone())
    }

    /// Active profile: `STARDAG_PROFILE` wins over `default_profile`.
    pub fn active_profile(&self) -> Option<(String, &Profile)> {
        let name = std::env::var("STARDAG_PROFILE")
            .ok()
            .or_else(|| self.default_profile.clone())?;
        self.profiles.get(&name).map(|profile| (name, profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigFile {
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
                workspace_id: Some("ws-1".to_string()),
                environment_id: Some("env-1".to_string()),
                user: Some("alice@example.com".to_string()),
            },
        );
        config.default_profile = Some("dev".to_string());
        config
    }

    #[test]
    fn toml_roundtrip() {
        let config = sample();
        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed: ConfigFile = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.default_profile.as_deref(), Some("dev"));
        assert_eq!(
            parsed.registries["local"].url,
            "http://localhost:8080"
        );
        assert_eq!(parsed.profiles["dev"].registry, "local");
    }

    #[test]
    fn registry_url_resolves_through_profile() {
        let config = sample();
        let profile = &config.profiles["dev"];
        assert_eq!(
            config.registry_url(profile).as_deref(),
            Some("http://localhost:8080")
        );
    }
}
