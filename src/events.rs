//! Engine Events
//!
//! Events emitted by the store, the optimizer and the lifecycle coordinator
//! for monitoring and observability.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the cache engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Value was written through both tiers
    Stored {
        key: String,
        size_bytes: u64,
        compressed: bool,
    },

    /// All keys under a prefix were removed
    PrefixDeleted {
        prefix: String,
        keys_removed: u64,
    },

    /// Storage optimization pass finished
    StorageOptimized {
        prefix: String,
        keys_touched: u64,
        bytes_before: u64,
        bytes_after: u64,
    },

    /// Remote store failed its health probe
    StoreDegraded {
        reason: String,
    },

    /// Remote store answered again after being degraded
    StoreRecovered,

    /// Virtual file dropped from the optimizer
    FileEvicted {
        repository: String,
        path: String,
        size_bytes: u64,
        reason: EvictionReason,
    },

    /// Related file warmed by the prefetcher
    Prefetched {
        repository: String,
        path: String,
        size_bytes: u64,
    },

    /// Adaptive re-evaluation picked a different strategy
    StrategyChanged {
        repository: String,
        from: String,
        to: String,
    },

    /// Repository state dropped from the optimizer
    RepositoryCleaned {
        repository: String,
        files_removed: u64,
    },

    /// Lifecycle entry changed state
    LifecycleTransition {
        key: String,
        from: String,
        to: String,
    },

    /// Cleanup of a lifecycle entry failed and will be retried
    CleanupFailed {
        key: String,
        error: String,
    },

    /// Memory high-water mark triggered a forced cleanup
    AggressiveCleanup {
        used_bytes: u64,
        entries_cleaned: usize,
    },
}

/// Reason a virtual file left the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    /// Memory ceiling reached
    Capacity,
    /// Entry expired (TTL)
    Expired,
    /// Resident file count above the configured cap
    Overflow,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Capacity => write!(f, "capacity"),
            EvictionReason::Expired => write!(f, "expired"),
            EvictionReason::Overflow => write!(f, "overflow"),
        }
    }
}

impl EngineEvent {
    /// Get the cache key associated with this event (if any)
    pub fn key(&self) -> Option<&str> {
        match self {
            EngineEvent::Stored { key, .. } => Some(key),
            EngineEvent::LifecycleTransition { key, .. } => Some(key),
            EngineEvent::CleanupFailed { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Get the repository associated with this event (if any)
    pub fn repository(&self) -> Option<&str> {
        match self {
            EngineEvent::FileEvicted { repository, .. } => Some(repository),
            EngineEvent::Prefetched { repository, .. } => Some(repository),
            EngineEvent::StrategyChanged { repository, .. } => Some(repository),
            EngineEvent::RepositoryCleaned { repository, .. } => Some(repository),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            EngineEvent::StoreDegraded { .. } | EngineEvent::CleanupFailed { .. }
        )
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Cloneable broadcaster shared by all engine components
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; dropped when nobody listens
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
