//! Content Sources
//!
//! The optimizer never talks to a forge directly; file content it cannot find
//! in the tiered store is pulled from a [`ContentSource`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Origin of repository file content
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetch a file's content; `Ok(None)` when the file does not exist upstream
    async fn fetch(&self, repository: &str, path: &str) -> Result<Option<String>>;
}

/// Map-backed source used by tests and the `--in-memory` binary mode
#[derive(Debug, Default)]
pub struct StaticSource {
    files: DashMap<(String, String), String>,
    failing: DashSet<(String, String)>,
    fetches: AtomicU64,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file
    pub fn insert(&self, repository: &str, path: &str, content: impl Into<String>) {
        self.files
            .insert((repository.to_string(), path.to_string()), content.into());
    }

    /// Make fetches of a path fail
    pub fn fail_path(&self, repository: &str, path: &str) {
        self.failing.insert((repository.to_string(), path.to_string()));
    }

    /// Number of fetches served so far, including failures
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ContentSource for StaticSource {
    async fn fetch(&self, repository: &str, path: &str) -> Result<Option<String>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let key = (repository.to_string(), path.to_string());
        if self.failing.contains(&key) {
            return Err(Error::StoreUnavailable(format!(
                "source fetch failed for {}:{}",
                repository, path
            )));
        }
        Ok(self.files.get(&key).map(|content| content.value().clone()))
    }
}

/// Reads `<root>/<owner/name>/<path>` from a local checkout directory
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, repository: &str, path: &str) -> Result<PathBuf> {
        let relative = Path::new(repository).join(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(Error::InvalidRepository(format!(
                "path escapes the content root: {}:{}",
                repository, path
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ContentSource for DirectorySource {
    async fn fetch(&self, repository: &str, path: &str) -> Result<Option<String>> {
        let full = self.resolve(repository, path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticSource::new();
        source.insert("acme/widgets", "README.md", "# widgets");
        source.fail_path("acme/widgets", "broken.rs");

        assert_eq!(
            source.fetch("acme/widgets", "README.md").await.unwrap(),
            Some("# widgets".to_string())
        );
        assert_eq!(source.fetch("acme/widgets", "missing.rs").await.unwrap(), None);
        assert!(source.fetch("acme/widgets", "broken.rs").await.is_err());
        assert_eq!(source.fetches(), 3);
    }

    #[tokio::test]
    async fn test_directory_source() {
        let root = tempfile::tempdir().unwrap();
        let repo_dir = root.path().join("acme/widgets/src");
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(repo_dir.join("lib.rs"), "pub mod widget;").unwrap();

        let source = DirectorySource::new(root.path());
        assert_eq!(
            source.fetch("acme/widgets", "src/lib.rs").await.unwrap(),
            Some("pub mod widget;".to_string())
        );
        assert_eq!(source.fetch("acme/widgets", "missing.rs").await.unwrap(), None);
        assert_matches!(
            source.fetch("acme/widgets", "../../etc/passwd").await,
            Err(Error::InvalidRepository(_))
        );
    }
}
