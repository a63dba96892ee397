//! Task output targets. Tasks write their own payloads through a target;
//! the registry never reads them — the engine only asks `exists()` for
//! completeness checks.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::TaskError;

#[async_trait]
pub trait Target: Send + Sync {
    /// Whether the output has been produced.
    async fn exists(&self) -> Result<bool, TaskError>;

    fn uri(&self) -> String;
}

/// Filesystem target.
pub struct LocalTarget {
    path: PathBuf,
}

impl LocalTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl Target for LocalTarget {
    async fn exists(&self) -> Result<bool, TaskError> {
        tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| TaskError::Target(format!("{}: {e}", self.path.display())))
    }

    fn uri(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Resolve a task-relative path against a named target root
/// (e.g. `default -> s3://bucket/prefix`).
pub fn resolve_target_uri(
    roots: &HashMap<String, String>,
    root_name: &str,
    relative_path: &str,
) -> Result<String, TaskError> {
    let root = roots.get(root_name).ok_or_else(|| {
        TaskError::Target(format!("unknown target root '{root_name}'"))
    })?;
    Ok(format!(
        "{}/{}",
        root.trim_end_matches('/'),
        relative_path.trim_start_matches('/')
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_target_tracks_file_existence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let target = LocalTarget::new(&path);
        assert!(!target.exists().await.unwrap());
        std::fs::write(&path, b"{}").unwrap();
        assert!(target.exists().await.unwrap());
    }

    #[test]
    fn target_uri_resolution_joins_cleanly() {
        let mut roots = HashMap::new();
        roots.insert("default".to_string(), "s3://bucket/prefix/".to_string());
        let uri = resolve_target_uri(&roots, "default", "/a/b.json").unwrap();
        assert_eq!(uri, "s3://bucket/prefix/a/b.json");
        assert!(resolve_target_uri(&roots, "missing", "x").is_err());
    }
}
