//! Cache Entry Types
//!
//! Defines cache keys, payloads and entries held by the in-process tier.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Number of shards used by key-sharded structures
pub const KEY_SHARD_COUNT: usize = 64;

// =============================================================================
// Cache Key
// =============================================================================

/// Namespaced key in the form `repo:<owner/name>:<facet>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for an arbitrary repository facet (tree, metadata, ...)
    pub fn repo(repository: &str, facet: &str) -> Self {
        Self(format!("repo:{}:{}", repository, facet))
    }

    /// Key for a single file's content
    pub fn file(repository: &str, path: &str) -> Self {
        Self(format!("repo:{}:file:{}", repository, path))
    }

    /// Prefix covering every key of a repository
    pub fn repo_prefix(repository: &str) -> String {
        format!("repo:{}:", repository)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Get the shard index for a raw key
#[inline]
pub fn shard_index(key: &str, shard_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count.max(1)
}

// =============================================================================
// Payload
// =============================================================================

/// Serialized value, held either as text or as gzip bytes, never both
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Serialized text below the compression threshold
    Plain(String),
    /// Gzip-compressed serialized text
    Compressed {
        bytes: Bytes,
        original_size: u64,
    },
}

impl Payload {
    /// Size of the serialized value before compression
    pub fn original_size(&self) -> u64 {
        match self {
            Payload::Plain(text) => text.len() as u64,
            Payload::Compressed { original_size, .. } => *original_size,
        }
    }

    /// Bytes actually held in memory
    pub fn stored_size(&self) -> u64 {
        match self {
            Payload::Plain(text) => text.len() as u64,
            Payload::Compressed { bytes, .. } => bytes.len() as u64,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Payload::Compressed { .. })
    }

    /// Get compression ratio (stored_size / original_size)
    pub fn compression_ratio(&self) -> f64 {
        let original = self.original_size();
        if original == 0 {
            1.0
        } else {
            self.stored_size() as f64 / original as f64
        }
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A cached value with metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Full store key
    pub key: String,
    /// Stored payload
    pub payload: Payload,
    /// Uncompressed size in bytes
    pub size_bytes: u64,
    /// Time when entry was cached
    pub created_at: DateTime<Utc>,
    /// Time after which the entry is stale (None = never)
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Create a new cache entry
    pub fn new(
        key: impl Into<String>,
        payload: Payload,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let size_bytes = payload.original_size();
        Self {
            key: key.into(),
            payload,
            size_bytes,
            created_at,
            expires_at,
        }
    }

    /// Check if the entry has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    /// Get the stored size in bytes
    pub fn stored_size(&self) -> u64 {
        self.payload.stored_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_cache_key_layout() {
        assert_eq!(CacheKey::repo("acme/widgets", "tree").as_str(), "repo:acme/widgets:tree");
        assert_eq!(
            CacheKey::file("acme/widgets", "src/lib.rs").as_str(),
            "repo:acme/widgets:file:src/lib.rs"
        );
        assert_eq!(CacheKey::repo_prefix("acme/widgets"), "repo:acme/widgets:");
        assert!(CacheKey::file("acme/widgets", "a")
            .as_str()
            .starts_with(&CacheKey::repo_prefix("acme/widgets")));
    }

    #[test]
    fn test_shard_index_is_stable() {
        let a = shard_index("repo:acme/widgets:tree", KEY_SHARD_COUNT);
        let b = shard_index("repo:acme/widgets:tree", KEY_SHARD_COUNT);
        assert_eq!(a, b);
        assert!(a < KEY_SHARD_COUNT);
        assert_eq!(shard_index("anything", 1), 0);
    }

    #[test]
    fn test_payload_sizes() {
        let plain = Payload::Plain("hello world".to_string());
        assert!(!plain.is_compressed());
        assert_eq!(plain.original_size(), 11);
        assert_eq!(plain.stored_size(), 11);
        assert!((plain.compression_ratio() - 1.0).abs() < 0.001);

        let compressed = Payload::Compressed {
            bytes: Bytes::from_static(b"abc"),
            original_size: 100,
        };
        assert!(compressed.is_compressed());
        assert_eq!(compressed.stored_size(), 3);
        assert!((compressed.compression_ratio() - 0.03).abs() < 0.001);
    }

    #[test]
    fn test_entry_expiry() {
        let now = Utc::now();
        let forever = CacheEntry::new("k", Payload::Plain("v".into()), now, None);
        assert!(!forever.is_expired(now + Duration::days(365)));

        let short = CacheEntry::new(
            "k",
            Payload::Plain("v".into()),
            now,
            Some(now + Duration::seconds(60)),
        );
        assert!(!short.is_expired(now + Duration::seconds(59)));
        assert!(short.is_expired(now + Duration::seconds(60)));
        assert_eq!(short.size_bytes, 1);
    }
}
