//! Time Source
//!
//! Every TTL, grace window and staleness check reads time through [`Clock`],
//! so the engine can run against wall-clock time in production and a manually
//! advanced clock in tests.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle
pub type ClockRef = Arc<dyn Clock>;

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock starting at the current wall-clock time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a manual clock starting at `start`
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Longest TTL honoured anywhere in the engine (100 years)
pub const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Clamp a caller-supplied TTL into `0..=MAX_TTL_SECS`
#[inline]
pub fn clamp_ttl_secs(seconds: u64) -> i64 {
    i64::try_from(seconds).unwrap_or(i64::MAX).min(MAX_TTL_SECS)
}

/// Convert whole seconds into a chrono duration, saturating at
/// [`MAX_TTL_SECS`]
#[inline]
pub fn secs(seconds: u64) -> Duration {
    Duration::seconds(clamp_ttl_secs(seconds))
}
