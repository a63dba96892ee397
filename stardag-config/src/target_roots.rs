//! Target-root maps per `(registry, workspace, environment)`, synced from
//! the registry, with `STARDAG_TARGET_ROOTS__<NAME>` overrides.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::paths;
use crate::ConfigError;

const ENV_OVERRIDE_PREFIX: &str = "STARDAG_TARGET_ROOTS__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetRootCache {
    /// `"<registry>/<workspace_id>/<environment_id>" -> {name -> uri}`.
    #[serde(default)]
    pub roots: BTreeMap<String, BTreeMap<String, String>>,
}

impl TargetRootCache {
    pub fn load() -> Result<Self, ConfigError> {
        let path = paths::target_root_cache_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = paths::target_root_cache_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn set(
        &mut self,
        registry: &str,
        workspace_id: &str,
        environment_id: &str,
        roots: BTreeMap<String, String>,
    ) {
        self.roots
            .insert(format!("{registry}/{workspace_id}/{environment_id}"), roots);
    }

    /// Cached roots with environment-variable overrides applied on top.
    pub fn resolve(
        &self,
        registry: &str,
        workspace_id: &str,
        environment_id: &str,
    ) -> HashMap<String, String> {
        let mut out: HashMap<String, String> = self
            .roots
            .get(&format!("{registry}/{workspace_id}/{environment_id}"))
            .map(|roots| roots.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(ENV_OVERRIDE_PREFIX) {
                out.insert(name.to_lowercase(), value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins_over_cache() {
        let _guard = crate::TEST_ENV_LOCK.lock().unwrap();
        let mut cache = TargetRootCache::default();
        let mut roots = BTreeMap::new();
        roots.insert("default".to_string(), "s3://bucket/a".to_string());
        cache.set("local", "ws", "env", roots);

        std::env::set_var("STARDAG_TARGET_ROOTS__DEFAULT", "file:///tmp/out");
        let resolved = cache.resolve("local", "ws", "env");
        assert_eq!(resolved["default"], "file:///tmp/out");
        std::env::remove_var("STARDAG_TARGET_ROOTS__DEFAULT");

        let resolved = cache.resolve("local", "ws", "env");
        assert_eq!(resolved["default"], "s3://bucket/a");
    }
}
