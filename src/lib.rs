//! Smart Repository Cache
//!
//! Intelligent cache lifecycle engine for repository content.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Cache Engine                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────┐   ┌─────────────────────┐   ┌───────────────────┐  │
//! │  │ Lifecycle           │──▶│ Access-Pattern      │──▶│ Content Source    │  │
//! │  │ Coordinator         │   │ Optimizer           │   │ (port)            │  │
//! │  │ (navigation, sweep) │   │ (virtual files,     │   └───────────────────┘  │
//! │  └──────────┬──────────┘   │  prefetch)          │                          │
//! │             │              └──────────┬──────────┘                          │
//! │             └────────────┬────────────┘                                     │
//! │                          ▼                                                  │
//! │              ┌───────────────────────┐                                      │
//! │              │  Tiered Cache Store   │                                      │
//! │              │  (sharded local LRU)  │                                      │
//! │              └───────────┬───────────┘                                      │
//! ├──────────────────────────┼──────────────────────────────────────────────────┤
//! │                          ▼                                                  │
//! │              ┌───────────────────────┐                                      │
//! │              │  KeyDB / Redis        │                                      │
//! │              │  (gzip + base64)      │                                      │
//! │              └───────────────────────┘                                      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`store`]: Tiered cache store over the remote key-value store
//! - [`optimizer`]: Access-pattern optimizer and prefetcher
//! - [`lifecycle`]: Navigation-driven lifecycle coordinator
//! - [`engine`]: Composition root and background loops
//! - [`error`]: Error types and handling

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod optimizer;
pub mod store;
pub mod telemetry;

// Re-export commonly used types
pub use clock::{Clock, ClockRef, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{CacheEngine, EngineStatus, OpenRepository, OpenedRepository};
pub use error::{BestEffort, Error, ErrorAction, Result};
pub use events::{EngineEvent, EventBus, EvictionReason};

pub use lifecycle::{
    LifecycleConfig, LifecycleCoordinator, LifecycleEntry, LifecycleState, NavigationEvent, NavigationEventType,
    NavigationOutcome, NavigationSession, SweepReport,
};

pub use optimizer::{
    AccessMetrics, AccessOptimizer, AccessPattern, CacheStrategy, ContentSource, DirectorySource, FileContent,
    OptimizerConfig, RepoFile, StaticSource,
};

pub use store::{
    CompressionManager, InMemoryRemoteStore, KeyDbConfig, KeyDbStore, RemoteStore, StoreConfig, TieredStore,
};

pub use telemetry::EngineMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
