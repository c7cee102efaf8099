//! Store Metrics
//!
//! Cache-line aligned atomic counters for the tiered store, plus a
//! serializable snapshot for the status surface.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Store Metrics (Cache-Line Aligned)
// =============================================================================

/// Read-path counters, aligned to prevent false sharing with the write path
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct ReadMetrics {
    /// Hits served by the in-process tier
    pub local_hits: AtomicU64,
    /// Hits served by the remote store
    pub remote_hits: AtomicU64,
    /// Keys absent from both tiers
    pub misses: AtomicU64,
    /// Bytes returned to callers (uncompressed)
    pub bytes_read: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<ReadMetrics>() <= CACHE_LINE_SIZE);

/// Write-path counters
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct WriteMetrics {
    /// Successful writes
    pub sets: AtomicU64,
    /// Writes that were compressed
    pub compressed_sets: AtomicU64,
    /// Keys deleted (single and prefix)
    pub deletes: AtomicU64,
    /// Bytes written before compression
    pub bytes_written: AtomicU64,
    /// Bytes written after compression
    pub bytes_stored: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<WriteMetrics>() <= CACHE_LINE_SIZE);

/// All counters of the tiered store
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub reads: ReadMetrics,
    pub writes: WriteMetrics,
    /// Operations that failed after retries
    pub errors: AtomicU64,
    /// Retries performed by the connection pool
    pub retries: AtomicU64,
    /// Operations that hit the per-operation timeout
    pub timeouts: AtomicU64,
    /// Pool re-initialisations after failed health checks
    pub reinitializations: AtomicU64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_local_hit(&self, bytes: u64) {
        self.reads.local_hits.fetch_add(1, Ordering::Relaxed);
        self.reads.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_remote_hit(&self, bytes: u64) {
        self.reads.remote_hits.fetch_add(1, Ordering::Relaxed);
        self.reads.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.reads.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_set(&self, original_bytes: u64, stored_bytes: u64, compressed: bool) {
        self.writes.sets.fetch_add(1, Ordering::Relaxed);
        if compressed {
            self.writes.compressed_sets.fetch_add(1, Ordering::Relaxed);
        }
        self.writes
            .bytes_written
            .fetch_add(original_bytes, Ordering::Relaxed);
        self.writes
            .bytes_stored
            .fetch_add(stored_bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_deletes(&self, count: u64) {
        self.writes.deletes.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reinitialization(&self) {
        self.reinitializations.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of all counters
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        let local_hits = self.reads.local_hits.load(Ordering::Relaxed);
        let remote_hits = self.reads.remote_hits.load(Ordering::Relaxed);
        let misses = self.reads.misses.load(Ordering::Relaxed);
        let total = local_hits + remote_hits + misses;

        StoreMetricsSnapshot {
            local_hits,
            remote_hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                (local_hits + remote_hits) as f64 / total as f64
            },
            bytes_read: self.reads.bytes_read.load(Ordering::Relaxed),
            sets: self.writes.sets.load(Ordering::Relaxed),
            compressed_sets: self.writes.compressed_sets.load(Ordering::Relaxed),
            deletes: self.writes.deletes.load(Ordering::Relaxed),
            bytes_written: self.writes.bytes_written.load(Ordering::Relaxed),
            bytes_stored: self.writes.bytes_stored.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            reinitializations: self.reinitializations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StoreMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreMetricsSnapshot {
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub bytes_read: u64,
    pub sets: u64,
    pub compressed_sets: u64,
    pub deletes: u64,
    pub bytes_written: u64,
    pub bytes_stored: u64,
    pub errors: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub reinitializations: u64,
}

impl StoreMetricsSnapshot {
    /// Ratio of stored to written bytes (1.0 = nothing saved)
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_written == 0 {
            1.0
        } else {
            self.bytes_stored as f64 / self.bytes_written as f64
        }
    }
}
