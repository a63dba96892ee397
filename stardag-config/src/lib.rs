//! Client-side configuration: `~/.stardag/` state files, profile
//! resolution and `STARDAG_*` environment overrides.

pub mod config;
pub mod credentials;
pub mod id_cache;
pub mod paths;
pub mod settings;
pub mod target_roots;
pub mod token_cache;

pub use config::{ConfigFile, Profile, RegistryEntry};
pub use credentials::Credentials;
pub use settings::ClientSettings;
pub use token_cache::CachedAccessToken;

use thiserror::Error;

/// Tests that mutate process environment variables serialize on this lock.
#[cfg(test)]
pub(crate) static TEST_ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config encode: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}
