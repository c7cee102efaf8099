//! Tiered Store
//!
//! Combines the in-process LRU tier with the remote store behind the
//! connection pool. Reads check the local tier first and populate it on a
//! remote hit; writes go through to the remote store and refresh the local
//! tier. Large values are compressed transparently.

use crate::clock::{secs, ClockRef};
use crate::error::{BestEffort, Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::store::compression::{CompressionConfig, CompressionManager};
use crate::store::entry::{CacheEntry, Payload};
use crate::store::local::LocalTier;
use crate::store::metrics::{StoreMetrics, StoreMetricsSnapshot};
use crate::store::pool::{ConnectionPool, PoolConfig};
use crate::store::remote::RemoteStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the tiered store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// KeyDB/Redis URL
    pub redis_url: String,
    /// Number of pooled remote clients
    pub pool_size: usize,
    /// Connect timeout, in seconds
    pub connect_timeout_secs: u64,
    /// Concurrency, timeout and retry policy
    pub pool: PoolConfig,
    /// Compression envelope
    pub compression: CompressionConfig,
    /// Entries held by the in-process tier
    pub local_capacity_entries: usize,
    /// Longest time a value stays in the in-process tier, in seconds
    pub local_ttl_secs: u64,
    /// Keys requested per SCAN step
    pub scan_batch: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 4,
            connect_timeout_secs: 30,
            pool: PoolConfig::default(),
            compression: CompressionConfig::default(),
            local_capacity_entries: 10_000,
            local_ttl_secs: 300,
            scan_batch: 500,
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Result of an [`TieredStore::optimize_storage`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub keys_scanned: u64,
    pub keys_touched: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Result of a health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub backend: String,
    pub latency_ms: u64,
    pub used_memory_bytes: Option<u64>,
    /// Whether a reconnect was attempted during this probe
    pub reinitialized: bool,
    pub error: Option<String>,
}

/// Status of the tiered store for the introspection surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub backend: String,
    pub degraded: bool,
    pub local_entries: u64,
    pub local_bytes: u64,
    pub local_evictions: u64,
    pub metrics: StoreMetricsSnapshot,
}

// =============================================================================
// Tiered Store
// =============================================================================

/// Local LRU in front of the remote key-value store
pub struct TieredStore {
    local: LocalTier,
    pool: ConnectionPool,
    compression: CompressionManager,
    metrics: Arc<StoreMetrics>,
    clock: ClockRef,
    events: EventBus,
    config: StoreConfig,
    degraded: AtomicBool,
}

impl TieredStore {
    /// Create a store over `remote`; call [`TieredStore::initialize`] before use
    pub fn new(config: StoreConfig, remote: Arc<dyn RemoteStore>, clock: ClockRef, events: EventBus) -> Self {
        let metrics = Arc::new(StoreMetrics::new());
        Self {
            local: LocalTier::new(config.local_capacity_entries, clock.clone()),
            pool: ConnectionPool::new(remote, config.pool.clone(), metrics.clone()),
            compression: CompressionManager::with_config(config.compression.clone()),
            metrics,
            clock,
            events,
            config,
            degraded: AtomicBool::new(false),
        }
    }

    /// Establish the remote connection.
    ///
    /// Fails with `StoreUnavailable` when the store cannot be reached in time.
    pub async fn initialize(&self) -> Result<()> {
        let connected = match self.pool.connect().await {
            Ok(()) => self.pool.run("PING", |remote| async move { remote.ping().await }).await,
            Err(e) => Err(e),
        };

        match connected {
            Ok(()) => {
                info!(backend = self.pool.backend(), "Tiered store initialized");
                Ok(())
            }
            Err(Error::Configuration(msg)) => Err(Error::Configuration(msg)),
            Err(e) => Err(Error::StoreUnavailable(format!(
                "{} unreachable: {}",
                self.pool.backend(),
                e
            ))),
        }
    }

    fn local_entry(&self, key: &str, payload: Payload, ttl_secs: Option<u64>) -> CacheEntry {
        let now = self.clock.now();
        let residency = match ttl_secs {
            Some(ttl) => ttl.min(self.config.local_ttl_secs),
            None => self.config.local_ttl_secs,
        };
        CacheEntry::new(key, payload, now, Some(now + secs(residency)))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get the serialized value for a key.
    ///
    /// Returns `Ok(None)` when the key does not exist in either tier.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.local.get(key) {
            let text = self.compression.unpack(&entry.payload)?;
            self.metrics.record_local_hit(text.len() as u64);
            return Ok(Some(text));
        }

        let wire = self.pool.run("GET", |remote| async move { remote.get(key).await }).await?;
        let Some(wire) = wire else {
            self.metrics.record_miss();
            return Ok(None);
        };

        let payload = self.compression.decode(wire);
        let text = match self.compression.unpack(&payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                self.delete(key).await.best_effort("drop undecodable entry");
                return Err(Error::serialization(key, e));
            }
        };

        self.metrics.record_remote_hit(text.len() as u64);

        // Local residency never outlives the remote expiry
        let remaining = self
            .pool
            .run("TTL", |remote| async move { remote.ttl(key).await })
            .await
            .best_effort("read remote ttl");
        if let Some(remaining) = remaining {
            self.local.insert(self.local_entry(key, payload, remaining));
        }
        Ok(Some(text))
    }

    /// Get and deserialize a JSON value.
    ///
    /// A value that no longer deserializes is dropped and reported as a
    /// serialization error.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(text) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&text) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping cache entry that no longer deserializes");
                self.delete(key).await.best_effort("drop undecodable entry");
                Err(Error::serialization(key, e))
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a serialized value, compressing it above the threshold
    pub async fn set(&self, key: &str, value: impl Into<String>, ttl_secs: Option<u64>) -> Result<()> {
        let text = value.into();
        let original_size = text.len() as u64;
        let (wire, payload) = self.compression.encode_text(text)?;
        let compressed = payload.is_compressed();
        let stored_size = payload.stored_size();

        let wire_ref = wire.as_str();
        self.pool
            .run("SET", |remote| async move { remote.set(key, wire_ref, ttl_secs).await })
            .await?;

        self.local.insert(self.local_entry(key, payload, ttl_secs));
        self.metrics.record_set(original_size, stored_size, compressed);

        debug!(key = %key, size_bytes = original_size, compressed, "Stored cache value");
        self.events.emit(EngineEvent::Stored {
            key: key.to_string(),
            size_bytes: original_size,
            compressed,
        });
        Ok(())
    }

    /// Serialize a value as JSON and store it
    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_secs: Option<u64>) -> Result<()> {
        let text = serde_json::to_string(value).map_err(|e| Error::serialization(key, e))?;
        self.set(key, text, ttl_secs).await
    }

    /// Delete a key from both tiers, returning whether the remote key existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.local.remove(key);
        let keys = [key.to_string()];
        let keys = &keys[..];
        let removed = self
            .pool
            .run("DEL", |remote| async move { remote.delete(keys).await })
            .await?;
        self.metrics.record_deletes(removed);
        Ok(removed > 0)
    }

    /// Delete every key starting with `prefix` using cursor-based scanning.
    ///
    /// Returns the number of remote keys removed.
    #[instrument(skip(self))]
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let local_removed = self.local.remove_prefix(prefix);
        let batch = self.config.scan_batch;
        let mut cursor = 0u64;
        let mut removed = 0u64;

        loop {
            let (next, keys) = self
                .pool
                .run("SCAN", |remote| async move { remote.scan_prefix(cursor, prefix, batch).await })
                .await?;

            if !keys.is_empty() {
                let keys = &keys[..];
                removed += self
                    .pool
                    .run("DEL", |remote| async move { remote.delete(keys).await })
                    .await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        self.metrics.record_deletes(removed);
        debug!(prefix = %prefix, removed, local_removed, "Deleted keys by prefix");
        self.events.emit(EngineEvent::PrefixDeleted {
            prefix: prefix.to_string(),
            keys_removed: removed,
        });
        Ok(removed)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Re-compress stored values under `prefix` where that makes them smaller.
    ///
    /// Content and TTLs are preserved; per-key failures are skipped.
    #[instrument(skip(self))]
    pub async fn optimize_storage(&self, prefix: &str) -> Result<OptimizeReport> {
        let batch = self.config.scan_batch;
        let mut report = OptimizeReport::default();
        let mut cursor = 0u64;

        loop {
            let (next, keys) = self
                .pool
                .run("SCAN", |remote| async move { remote.scan_prefix(cursor, prefix, batch).await })
                .await?;

            for key in &keys {
                report.keys_scanned += 1;
                match self.optimize_key(key).await {
                    Ok(Some((before, after))) => {
                        report.bytes_before += before;
                        report.bytes_after += after;
                        if after < before {
                            report.keys_touched += 1;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(key = %key, error = %e, "Skipping key during storage optimization"),
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        info!(
            prefix = %prefix,
            keys_scanned = report.keys_scanned,
            keys_touched = report.keys_touched,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            "Storage optimization complete"
        );
        self.events.emit(EngineEvent::StorageOptimized {
            prefix: prefix.to_string(),
            keys_touched: report.keys_touched,
            bytes_before: report.bytes_before,
            bytes_after: report.bytes_after,
        });
        Ok(report)
    }

    /// Returns (bytes before, bytes after) for a key that still exists
    async fn optimize_key(&self, key: &str) -> Result<Option<(u64, u64)>> {
        let Some(wire) = self.pool.run("GET", |remote| async move { remote.get(key).await }).await? else {
            return Ok(None);
        };
        let before = wire.len() as u64;

        let text = self.compression.decode_text(wire)?;
        let (candidate, _) = self.compression.encode_text(text)?;
        let after = candidate.len() as u64;
        if after >= before {
            return Ok(Some((before, before)));
        }

        let ttl = self.pool.run("TTL", |remote| async move { remote.ttl(key).await }).await?;
        let candidate_ref = candidate.as_str();
        self.pool
            .run("SET", |remote| async move { remote.set(key, candidate_ref, ttl).await })
            .await?;
        self.local.remove(key);
        Ok(Some((before, after)))
    }

    /// Probe the remote store, re-initialising the pool on failure.
    ///
    /// Never fails; degradation is reported in the returned report.
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let probe = self.pool.run("PING", |remote| async move { remote.ping().await }).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match probe {
            Ok(()) => {
                let used_memory_bytes = self.memory_usage().await.best_effort("read used memory");
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!(backend = self.pool.backend(), "Remote store recovered");
                    self.events.emit(EngineEvent::StoreRecovered);
                }
                HealthReport {
                    healthy: true,
                    backend: self.pool.backend().to_string(),
                    latency_ms,
                    used_memory_bytes,
                    reinitialized: false,
                    error: None,
                }
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    warn!(backend = self.pool.backend(), error = %e, "Remote store degraded");
                    self.events.emit(EngineEvent::StoreDegraded {
                        reason: e.to_string(),
                    });
                }
                let reinitialized = self.pool.reinitialize().await.unwrap_or(false);
                if reinitialized {
                    self.degraded.store(false, Ordering::Release);
                    self.events.emit(EngineEvent::StoreRecovered);
                }
                HealthReport {
                    healthy: reinitialized,
                    backend: self.pool.backend().to_string(),
                    latency_ms,
                    used_memory_bytes: None,
                    reinitialized: true,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Memory used by the remote store, in bytes
    pub async fn memory_usage(&self) -> Result<u64> {
        self.pool
            .run("INFO", |remote| async move { remote.used_memory().await })
            .await
    }

    /// Drop expired entries from the in-process tier
    pub fn purge_local_expired(&self) -> u64 {
        self.local.purge_expired()
    }

    /// Whether the last health probe failed
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Get store status
    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            backend: self.pool.backend().to_string(),
            degraded: self.is_degraded(),
            local_entries: self.local.len(),
            local_bytes: self.local.stored_bytes(),
            local_evictions: self.local.evictions(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::clock::ManualClock;
    use crate::store::remote::InMemoryRemoteStore;

    struct Fixture {
        store: TieredStore,
        remote: Arc<InMemoryRemoteStore>,
        clock: Arc<ManualClock>,
        events: EventBus,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let remote = Arc::new(InMemoryRemoteStore::new(clock.clone()));
        let events = EventBus::new(64);
        let config = StoreConfig {
            pool: PoolConfig {
                retry_initial_ms: 1,
                retry_max_ms: 2,
                ..Default::default()
            },
            scan_batch: 3,
            ..Default::default()
        };
        let store = TieredStore::new(config, remote.clone(), clock.clone(), events.clone());
        Fixture {
            store,
            remote,
            clock,
            events,
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Tree {
        paths: Vec<String>,
    }

    #[tokio::test]
    async fn test_initialize_reports_unavailable() {
        let f = fixture();
        f.store.initialize().await.unwrap();

        f.remote.set_available(false);
        let err = f.store.initialize().await.unwrap_err();
        assert_matches!(err, Error::StoreUnavailable(_));
    }

    #[tokio::test]
    async fn test_roundtrip_small_and_large_values() {
        let f = fixture();

        f.store.set("repo:a/b:small", "{\"n\":1}", None).await.unwrap();
        let large = "x".repeat(4096);
        f.store.set("repo:a/b:large", large.clone(), Some(60)).await.unwrap();

        assert_eq!(f.store.get("repo:a/b:small").await.unwrap().unwrap(), "{\"n\":1}");
        assert_eq!(f.store.get("repo:a/b:large").await.unwrap().unwrap(), large);

        // The remote copy is the compressed envelope, not the raw text
        let raw = f.remote.raw("repo:a/b:large").unwrap();
        assert!(raw.len() < large.len());
        assert_eq!(f.remote.raw("repo:a/b:small").unwrap(), "{\"n\":1}");

        let snap = f.store.status().metrics;
        assert_eq!(snap.sets, 2);
        assert_eq!(snap.compressed_sets, 1);
    }

    #[tokio::test]
    async fn test_local_tier_serves_repeat_reads() {
        let f = fixture();
        f.remote.set("repo:a/b:tree", "[]", None).await.unwrap();

        assert_eq!(f.store.get("repo:a/b:tree").await.unwrap().unwrap(), "[]");
        assert_eq!(f.store.get("repo:a/b:tree").await.unwrap().unwrap(), "[]");

        assert_eq!(f.remote.get_calls(), 1);
        let snap = f.store.status().metrics;
        assert_eq!(snap.remote_hits, 1);
        assert_eq!(snap.local_hits, 1);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_an_error() {
        let f = fixture();
        assert_eq!(f.store.get("repo:a/b:nothing").await.unwrap(), None);
        assert_eq!(f.store.status().metrics.misses, 1);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let f = fixture();
        let tree = Tree {
            paths: vec!["README.md".into(), "src/lib.rs".into()],
        };
        f.store.set_json("repo:a/b:tree", &tree, None).await.unwrap();
        let back: Tree = f.store.get_json("repo:a/b:tree").await.unwrap().unwrap();
        assert_eq!(back, tree);
    }

    #[tokio::test]
    async fn test_undeserializable_value_is_dropped() {
        let f = fixture();
        f.remote.set("repo:a/b:tree", "not json", None).await.unwrap();

        let err = f.store.get_json::<Tree>("repo:a/b:tree").await.unwrap_err();
        assert_matches!(err, Error::Serialization { .. });
        assert!(f.remote.raw("repo:a/b:tree").is_none());
    }

    #[tokio::test]
    async fn test_delete_prefix_scans_in_batches() {
        let f = fixture();
        for i in 0..10 {
            f.store
                .set(&format!("repo:acme/widgets:file:{}", i), "c", None)
                .await
                .unwrap();
        }
        f.store.set("repo:acme/gadgets:tree", "t", None).await.unwrap();

        let removed = f.store.delete_prefix("repo:acme/widgets:").await.unwrap();
        assert_eq!(removed, 10);
        assert_eq!(f.remote.len(), 1);
        assert_eq!(f.store.get("repo:acme/widgets:file:3").await.unwrap(), None);
        assert_eq!(
            f.store.get("repo:acme/gadgets:tree").await.unwrap().unwrap(),
            "t"
        );
    }

    #[tokio::test]
    async fn test_optimize_storage_recompresses_legacy_values() {
        let f = fixture();
        let legacy = "legacy uncompressed content ".repeat(100);
        f.remote.set("repo:a/b:file:big", &legacy, Some(600)).await.unwrap();
        f.remote.set("repo:a/b:file:tiny", "t", None).await.unwrap();

        let report = f.store.optimize_storage("repo:a/b:").await.unwrap();
        assert_eq!(report.keys_scanned, 2);
        assert_eq!(report.keys_touched, 1);
        assert!(report.bytes_after < report.bytes_before);

        // Content and TTL survive
        assert_eq!(f.store.get("repo:a/b:file:big").await.unwrap().unwrap(), legacy);
        assert_eq!(f.remote.ttl("repo:a/b:file:big").await.unwrap(), Some(600));
        assert_eq!(f.remote.raw("repo:a/b:file:tiny").unwrap(), "t");

        // Second pass finds nothing to gain
        let again = f.store.optimize_storage("repo:a/b:").await.unwrap();
        assert_eq!(again.keys_touched, 0);
    }

    #[tokio::test]
    async fn test_health_check_degrades_and_recovers() {
        let f = fixture();
        let mut rx = f.events.subscribe();

        let healthy = f.store.health_check().await;
        assert!(healthy.healthy);
        assert!(healthy.used_memory_bytes.is_some());

        f.remote.set_available(false);
        let degraded = f.store.health_check().await;
        assert!(!degraded.healthy);
        assert!(degraded.reinitialized);
        assert!(f.store.is_degraded());
        assert_matches!(rx.recv().await.unwrap(), EngineEvent::StoreDegraded { .. });

        f.remote.set_available(true);
        let recovered = f.store.health_check().await;
        assert!(recovered.healthy);
        assert!(!f.store.is_degraded());
        assert_matches!(rx.recv().await.unwrap(), EngineEvent::StoreRecovered);
    }

    #[tokio::test]
    async fn test_local_residency_is_bounded_by_ttl() {
        let f = fixture();
        f.store.set("repo:a/b:meta", "{}", Some(10)).await.unwrap();

        f.clock.advance(secs(11));
        assert_eq!(f.store.get("repo:a/b:meta").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remote_hit_keeps_remote_expiry() {
        let f = fixture();
        f.remote.set("repo:a/b:branches", "[\"main\"]", Some(10)).await.unwrap();
        f.remote.set("repo:a/b:owners", "[]", None).await.unwrap();

        assert!(f.store.get("repo:a/b:branches").await.unwrap().is_some());
        assert!(f.store.get("repo:a/b:owners").await.unwrap().is_some());

        f.clock.advance(secs(11));
        assert_eq!(f.store.get("repo:a/b:branches").await.unwrap(), None);
        // Keys without a remote expiry still use the local residency
        let calls = f.remote.get_calls();
        assert!(f.store.get("repo:a/b:owners").await.unwrap().is_some());
        assert_eq!(f.remote.get_calls(), calls);
    }
}
