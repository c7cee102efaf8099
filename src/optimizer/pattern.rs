//! Access Pattern Classification
//!
//! Every access to a virtual file updates its [`AccessMetrics`] and
//! re-classifies the file from its access count and rolling average
//! inter-access interval:
//!
//! | Pattern     | Rule (defaults)                                       |
//! |-------------|-------------------------------------------------------|
//! | `frequent`  | average interval < 5 min and count > 10               |
//! | `clustered` | average interval < 1 hour, or count in 5..=10         |
//! | `random`    | count > 10                                            |
//! | `rare`      | everything else, including files seen only once       |
//!
//! The next access is predicted only for `frequent` and `clustered` files.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Access Pattern
// =============================================================================

/// How often and how regularly a file is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPattern {
    #[default]
    Rare,
    Clustered,
    Random,
    Frequent,
}

impl AccessPattern {
    /// Whether a next-access prediction is meaningful for this pattern
    pub fn is_predictable(&self) -> bool {
        matches!(self, AccessPattern::Frequent | AccessPattern::Clustered)
    }
}

impl fmt::Display for AccessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessPattern::Rare => write!(f, "rare"),
            AccessPattern::Clustered => write!(f, "clustered"),
            AccessPattern::Random => write!(f, "random"),
            AccessPattern::Frequent => write!(f, "frequent"),
        }
    }
}

// =============================================================================
// Thresholds
// =============================================================================

/// Tunable cut-offs for pattern classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternThresholds {
    /// Average interval below which a busy file is `frequent`
    pub frequent_interval_secs: u64,
    /// Access count a file must exceed to be `frequent` or `random`
    pub busy_count_above: u64,
    /// Average interval below which a file is `clustered`
    pub clustered_interval_secs: u64,
    /// Lower bound of the count range that is always `clustered`
    pub clustered_min_count: u64,
    /// Upper bound of the count range that is always `clustered`
    pub clustered_max_count: u64,
}

impl Default for PatternThresholds {
    fn default() -> Self {
        Self {
            frequent_interval_secs: 300,
            busy_count_above: 10,
            clustered_interval_secs: 3600,
            clustered_min_count: 5,
            clustered_max_count: 10,
        }
    }
}

/// Classify a file from its access count and average interval.
///
/// An interval only exists once a file has been read twice, so a single
/// access is always `rare`.
pub fn classify(access_count: u64, avg_interval_secs: f64, thresholds: &PatternThresholds) -> AccessPattern {
    if access_count < 2 {
        return AccessPattern::Rare;
    }

    let busy = access_count > thresholds.busy_count_above;
    if busy && avg_interval_secs < thresholds.frequent_interval_secs as f64 {
        AccessPattern::Frequent
    } else if avg_interval_secs < thresholds.clustered_interval_secs as f64
        || (thresholds.clustered_min_count..=thresholds.clustered_max_count).contains(&access_count)
    {
        AccessPattern::Clustered
    } else if busy {
        AccessPattern::Random
    } else {
        AccessPattern::Rare
    }
}

// =============================================================================
// Access Metrics
// =============================================================================

/// Per-file access statistics, owned by the file's virtual entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessMetrics {
    pub access_count: u64,
    pub first_access: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// Rolling mean of the gaps between consecutive accesses
    pub avg_interval_secs: f64,
    pub pattern: AccessPattern,
    pub predicted_next_access: Option<DateTime<Utc>>,
    pub bytes_served: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl AccessMetrics {
    /// Metrics for a file's first access
    pub fn first_access(now: DateTime<Utc>, bytes: u64, hit: bool) -> Self {
        Self {
            access_count: 1,
            first_access: now,
            last_access: now,
            avg_interval_secs: 0.0,
            pattern: AccessPattern::Rare,
            predicted_next_access: None,
            bytes_served: bytes,
            cache_hits: u64::from(hit),
            cache_misses: u64::from(!hit),
        }
    }

    /// Record another access and re-classify
    pub fn record_access(&mut self, now: DateTime<Utc>, bytes: u64, hit: bool, thresholds: &PatternThresholds) {
        let interval = (now - self.last_access).num_milliseconds().max(0) as f64 / 1000.0;

        self.access_count += 1;
        let intervals = (self.access_count - 1) as f64;
        self.avg_interval_secs += (interval - self.avg_interval_secs) / intervals;

        self.last_access = now;
        self.bytes_served += bytes;
        if hit {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }

        self.pattern = classify(self.access_count, self.avg_interval_secs, thresholds);
        self.predicted_next_access = if self.pattern.is_predictable() {
            Some(self.last_access + Duration::milliseconds((self.avg_interval_secs * 1000.0) as i64))
        } else {
            None
        };
    }

    /// Fraction of accesses served without a fetch
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
