//! Access-Pattern Optimizer
//!
//! Owns the per-repository file index and the resident virtual files built on
//! top of the tiered store:
//!
//! ```text
//!   get_file_content(repo, path)
//!          │
//!          ▼
//!   ┌──────────────┐  miss   ┌──────────────┐  miss   ┌───────────────┐
//!   │ virtual files│ ──────▶ │ tiered store │ ──────▶ │ content source│
//!   └──────────────┘         └──────────────┘         └───────────────┘
//!          │                        ▲
//!          │ related files          │ warm
//!          ▼                        │
//!   ┌──────────────┐    drainer     │
//!   │  prefetcher  │ ───────────────┘
//!   └──────────────┘
//! ```
//!
//! Resident bytes are held under a memory ceiling; a periodic pass drops
//! expired files, trims overflow and re-evaluates adaptive repositories.

pub mod engine;
pub mod file;
pub mod pattern;
pub mod prefetch;
pub mod source;
pub mod strategy;

pub use engine::{
    AccessOptimizer, InitializeReport, OptimizationSummary, OptimizerStatus, RepositoryCleanup,
    RepositoryStatus,
};
pub use file::{FileContent, VirtualFile};
pub use pattern::{AccessMetrics, AccessPattern, PatternThresholds};
pub use prefetch::{PrefetchConfig, PrefetchRequest, PrefetchStatsSnapshot, Prefetcher};
pub use source::{ContentSource, DirectorySource, StaticSource};
pub use strategy::{AdaptiveThresholds, CacheStrategy, RepoFile, StrategyConfig};

use serde::{Deserialize, Serialize};

/// Configuration for the access-pattern optimizer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Resident byte ceiling for virtual files
    pub memory_ceiling_bytes: u64,
    /// Fraction of the ceiling that eviction brings usage down to
    pub eviction_target_ratio: f64,
    /// Resident file cap checked by the periodic pass
    pub max_resident_files: usize,
    /// Fraction of files dropped when the cap is exceeded
    pub overflow_evict_fraction: f64,
    /// Lifetime of a resident virtual file and of file content in the store
    pub file_ttl_secs: u64,
    /// Periodic optimization interval, in seconds
    pub optimize_interval_secs: u64,
    /// Concurrent fetches while preloading a repository
    pub preload_concurrency: usize,
    pub adaptive: AdaptiveThresholds,
    pub patterns: PatternThresholds,
    pub strategy: StrategyConfig,
    pub prefetch: PrefetchConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 256 * 1024 * 1024,
            eviction_target_ratio: 0.8,
            max_resident_files: 10_000,
            overflow_evict_fraction: 0.2,
            file_ttl_secs: 3600,
            optimize_interval_secs: 300,
            preload_concurrency: 8,
            adaptive: AdaptiveThresholds::default(),
            patterns: PatternThresholds::default(),
            strategy: StrategyConfig::default(),
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl OptimizerConfig {
    /// Resident bytes that an eviction pass brings usage down to
    pub fn eviction_target_bytes(&self) -> u64 {
        (self.memory_ceiling_bytes as f64 * self.eviction_target_ratio) as u64
    }
}
