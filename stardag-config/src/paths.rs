//! Locations of persisted client state under `~/.stardag/`.

use std::path::PathBuf;

/// Base directory; `STARDAG_HOME` overrides for tests and sandboxes.
pub fn stardag_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STARDAG_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".stardag")
}

pub fn config_file() -> PathBuf {
    stardag_dir().join("config.toml")
}

pub fn credentials_dir() -> PathBuf {
    stardag_dir().join("credentials")
}

pub fn access_token_cache_dir() -> PathBuf {
    stardag_dir().join("access-token-cache")
}

pub fn id_cache_file() -> PathBuf {
    stardag_dir().join("id-cache.json")
}

pub fn target_root_cache_file() -> PathBuf {
    stardag_dir().join("target-root-cache.json")
}

/// Make a user identifier filesystem-safe: `@` becomes `_at_`; `/`, `\`
/// and `:` become `_`.
pub fn safe_user(user: &str) -> String {
    user.replace('@', "_at_")
        .replace(['/', '\\', ':'], "_")
}

pub fn credentials_file(registry: &str, user: &str) -> PathBuf {
    credentials_dir().join(format!("{registry}__{}.json", safe_user(user)))
}

pub fn access_token_cache_file(registry: &str, user: &str, workspace_id: &str) -> PathBuf {
    access_token_cache_dir().join(format!(
        "{registry}__{}__{workspace_id}.json",
        safe_user(user)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_user_transforms() {
        assert_eq!(safe_user("alice@example.com"), "alice_at_example.com");
        assert_eq!(safe_user("a/b\\c:d"), "a_b_c_d");
    }

    #[test]
    fn cache_file_names_combine_registry_user_workspace() {
        let _guard = crate::TEST_ENV_LOCK.lock().unwrap();
        std::env::set_var("STARDAG_HOME", "/tmp/stardag-test-home");
        let path = access_token_cache_file("local", "alice@example.com", "ws-1");
        assert!(path
            .to_string_lossy()
            .ends_with("access-token-cache/local__alice_at_example.com__ws-1.json"));
        std::env::remove_var("STARDAG_HOME");
    }
}
