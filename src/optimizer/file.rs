//! Virtual Files
//!
//! A [`VirtualFile`] is the optimizer's resident copy of one file's content,
//! held either as text or as gzip bytes (never both), together with its
//! checksum and access metrics.

use crate::error::{Error, Result};
use crate::optimizer::pattern::AccessMetrics;
use crate::store::compression::CompressionManager;
use crate::store::entry::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of file content
pub fn checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Detect a language tag from a path's extension or well-known file name
pub fn detect_language(path: &str) -> Option<&'static str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name {
        "Dockerfile" => return Some("dockerfile"),
        "Makefile" => return Some("makefile"),
        _ => {}
    }

    let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
    let language = match ext.as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" => "typescript",
        "tsx" | "jsx" => "react",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "cs" => "csharp",
        "swift" => "swift",
        "php" => "php",
        "sh" | "bash" => "shell",
        "md" => "markdown",
        "json" => "json",
        "toml" => "toml",
        "yml" | "yaml" => "yaml",
        "html" => "html",
        "css" => "css",
        "sql" => "sql",
        _ => return None,
    };
    Some(language)
}

/// Content returned to readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub repository: String,
    pub path: String,
    pub content: String,
    pub language: Option<String>,
    pub size_bytes: u64,
    /// Served from the resident virtual file without a fetch
    pub from_memory: bool,
}

/// Resident copy of a file held by the optimizer
#[derive(Debug, Clone)]
pub struct VirtualFile {
    pub path: String,
    pub content: Payload,
    /// Uncompressed size
    pub size_bytes: u64,
    pub language: Option<&'static str>,
    pub checksum: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metrics: AccessMetrics,
}

impl VirtualFile {
    /// Build a virtual file from freshly fetched content.
    ///
    /// `hit` records whether the content came from the tiered store rather
    /// than the origin source.
    pub fn new(
        path: impl Into<String>,
        text: String,
        compression: &CompressionManager,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        hit: bool,
    ) -> Result<Self> {
        let path = path.into();
        let size_bytes = text.len() as u64;
        let checksum = checksum(&text);
        let content = compression.pack(text)?;

        Ok(Self {
            language: detect_language(&path),
            metrics: AccessMetrics::first_access(now, size_bytes, hit),
            path,
            content,
            size_bytes,
            checksum,
            cached_at: now,
            expires_at,
        })
    }

    /// Recover the text, verifying it against the stored checksum
    pub fn text(&self, compression: &CompressionManager) -> Result<String> {
        let text = compression.unpack(&self.content)?;
        if checksum(&text) != self.checksum {
            return Err(Error::serialization(
                self.path.clone(),
                "content does not match checksum",
            ));
        }
        Ok(text)
    }

    /// Bytes this file occupies in memory
    pub fn resident_bytes(&self) -> u64 {
        self.content.stored_size()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::secs;

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("src/lib.rs"), Some("rust"));
        assert_eq!(detect_language("web/App.TSX"), Some("react"));
        assert_eq!(detect_language("Dockerfile"), Some("dockerfile"));
        assert_eq!(detect_language("README.md"), Some("markdown"));
        assert_eq!(detect_language("LICENSE"), None);
        assert_eq!(detect_language("archive.tar.zst"), None);
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(checksum("abc"), checksum("abc"));
        assert_ne!(checksum("abc"), checksum("abd"));
        assert_eq!(checksum("").len(), 64);
    }

    #[test]
    fn test_small_file_is_plain() {
        let compression = CompressionManager::default();
        let file = VirtualFile::new("README.md", "# widgets".into(), &compression, Utc::now(), None, false).unwrap();

        assert!(!file.content.is_compressed());
        assert_eq!(file.size_bytes, 9);
        assert_eq!(file.resident_bytes(), 9);
        assert_eq!(file.language, Some("markdown"));
        assert_eq!(file.text(&compression).unwrap(), "# widgets");
        assert_eq!(file.metrics.access_count, 1);
        assert_eq!(file.metrics.cache_misses, 1);
    }

    #[test]
    fn test_large_file_is_compressed() {
        let compression = CompressionManager::default();
        let text = "fn widget() {}\n".repeat(200);
        let file = VirtualFile::new("src/lib.rs", text.clone(), &compression, Utc::now(), None, true).unwrap();

        assert!(file.content.is_compressed());
        assert!(file.resident_bytes() < file.size_bytes);
        assert_eq!(file.text(&compression).unwrap(), text);
    }

    #[test]
    fn test_checksum_mismatch_is_detected() {
        let compression = CompressionManager::default();
        let mut file = VirtualFile::new("a.txt", "one".into(), &compression, Utc::now(), None, false).unwrap();
        file.content = Payload::Plain("two".into());

        assert!(matches!(
            file.text(&compression),
            Err(Error::Serialization { .. })
        ));
    }

    #[test]
    fn test_expiry() {
        let compression = CompressionManager::default();
        let now = Utc::now();
        let file = VirtualFile::new("a.rs", "x".into(), &compression, now, Some(now + secs(60)), false).unwrap();
        assert!(!file.is_expired(now + secs(59)));
        assert!(file.is_expired(now + secs(60)));
    }
}
