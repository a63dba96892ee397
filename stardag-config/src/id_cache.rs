//! Slug <-> UUID mappings so the CLI can accept slugs without a lookup on
//! every invocation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::paths;
use crate::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdCache {
    /// `"<registry>/<kind>/<slug>" -> uuid`, e.g.
    /// `"local/workspace/acme" -> "…"`.
    #[serde(default)]
    pub ids: BTreeMap<String, String>,
}

impl IdCache {
    pub fn load() -> Result<Self, ConfigError> {
        let path = paths::id_cache_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = paths::id_cache_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn get(&self, registry: &str, kind: &str, slug: &str) -> Option<&String> {
        self.ids.get(&format!("{registry}/{kind}/{slug}"))
    }

    pub fn put(&mut self, registry: &str, kind: &str, slug: &str, id: String) {
        self.ids.insert(format!("{registry}/{kind}/{slug}"), id);
    }
}
