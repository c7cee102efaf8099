//! Tiered Cache Store
//!
//! A bounded in-process LRU in front of a remote KeyDB/Redis store:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 TieredStore                  │
//! │  ┌────────────┐   miss   ┌─────────────────┐ │
//! │  │ LocalTier  │ ───────► │ ConnectionPool  │ │
//! │  │ (64 shards)│ ◄─────── │ ceiling/timeout │ │
//! │  └────────────┘ populate │ retry/reinit    │ │
//! │                          └───────┬─────────┘ │
//! └──────────────────────────────────┼───────────┘
//!                                    ▼
//!                             RemoteStore (fred)
//! ```
//!
//! Values above the compression threshold are gzip-compressed and base64
//! encoded before they leave the process.

pub mod compression;
pub mod entry;
pub mod local;
pub mod metrics;
pub mod pool;
pub mod remote;
pub mod tiered;

pub use compression::{CompressionConfig, CompressionManager};
pub use entry::{CacheEntry, CacheKey, Payload};
pub use local::LocalTier;
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use pool::{ConnectionPool, PoolConfig};
pub use remote::{InMemoryRemoteStore, KeyDbConfig, KeyDbStore, RemoteStore};
pub use tiered::{HealthReport, OptimizeReport, StoreConfig, StoreStatus, TieredStore};
