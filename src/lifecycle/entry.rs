//! Lifecycle Entries
//!
//! ```text
//!  initializing ──▶ active ──▶ expiring ──▶ expired ──▶ cleaning_up ──▶ cleaned
//!        │            ▲  │        │  ▲                    ▲    │
//!        │            └──┼────────┘  └────────────────────┼────┘ (failure)
//!        └───────────────┴────────────────────────────────┘
//! ```
//!
//! `expiring -> active` is the preserve path taken when an entry is read
//! again inside its grace window. Live entries may be cleaned immediately;
//! a failed cleanup parks the entry in `expired` for the next sweep.

use crate::clock::secs;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a lifecycle entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Initializing,
    Active,
    Expiring,
    Expired,
    CleaningUp,
    Cleaned,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::Initializing,
        LifecycleState::Active,
        LifecycleState::Expiring,
        LifecycleState::Expired,
        LifecycleState::CleaningUp,
        LifecycleState::Cleaned,
    ];

    /// Whether `next` is a legal successor
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Initializing, Active | Expiring | Expired | CleaningUp)
                | (Active, Expiring | Expired | CleaningUp)
                | (Expiring, Active | Expired | CleaningUp)
                | (Expired, CleaningUp)
                | (CleaningUp, Cleaned | Expired)
        )
    }

    /// Entry still holds cache resources and is not being torn down
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            LifecycleState::Initializing | LifecycleState::Active | LifecycleState::Expiring
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Cleaned)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Initializing => "initializing",
            LifecycleState::Active => "active",
            LifecycleState::Expiring => "expiring",
            LifecycleState::Expired => "expired",
            LifecycleState::CleaningUp => "cleaning_up",
            LifecycleState::Cleaned => "cleaned",
        };
        f.write_str(name)
    }
}

/// Lifecycle record of one cache key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEntry {
    pub key: String,
    pub user_id: String,
    pub repository: String,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set while a delayed cleanup is pending
    pub cleanup_scheduled_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    /// Navigation path that caused the entry to be cached
    pub navigation_context: String,
}

impl LifecycleEntry {
    pub fn new(
        key: impl Into<String>,
        user_id: impl Into<String>,
        repository: impl Into<String>,
        navigation_context: impl Into<String>,
        now: DateTime<Utc>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            key: key.into(),
            user_id: user_id.into(),
            repository: repository.into(),
            state: LifecycleState::Initializing,
            created_at: now,
            last_accessed: now,
            expires_at: now + secs(ttl_secs),
            cleanup_scheduled_at: None,
            access_count: 0,
            navigation_context: navigation_context.into(),
        }
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: LifecycleState) -> Result<LifecycleState> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                key: self.key.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.state;
        self.state = next;
        if next != LifecycleState::Expiring {
            self.cleanup_scheduled_at = None;
        }
        Ok(previous)
    }

    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = now;
    }

    /// Accessed within `window_secs` of `now`
    pub fn accessed_within(&self, now: DateTime<Utc>, window_secs: u64) -> bool {
        now - self.last_accessed <= secs(window_secs)
    }

    pub fn is_past_ttl(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_cleanup_due(&self, now: DateTime<Utc>) -> bool {
        self.cleanup_scheduled_at.map(|at| now >= at).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LifecycleEntry {
        LifecycleEntry::new(
            "repo:acme/widgets:tree",
            "u1",
            "acme/widgets",
            "/repos/acme/widgets",
            Utc::now(),
            60,
        )
    }

    #[test]
    fn test_happy_path() {
        let mut entry = entry();
        assert_eq!(entry.state, LifecycleState::Initializing);

        for next in [
            LifecycleState::Active,
            LifecycleState::Expiring,
            LifecycleState::Expired,
            LifecycleState::CleaningUp,
            LifecycleState::Cleaned,
        ] {
            entry.transition(next).unwrap();
        }
        assert!(entry.state.is_terminal());
    }

    #[test]
    fn test_cleaned_is_terminal() {
        for next in LifecycleState::ALL {
            assert!(!LifecycleState::Cleaned.can_transition_to(next));
        }
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut entry = entry();
        let err = entry.transition(LifecycleState::Cleaned).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition { ref from, ref to, .. } if from == "initializing" && to == "cleaned"
        ));
        assert_eq!(entry.state, LifecycleState::Initializing);
    }

    #[test]
    fn test_preserve_path_and_failed_cleanup() {
        let mut entry = entry();
        entry.transition(LifecycleState::Active).unwrap();
        entry.transition(LifecycleState::Expiring).unwrap();
        entry.cleanup_scheduled_at = Some(entry.created_at + secs(30));

        entry.transition(LifecycleState::Active).unwrap();
        assert_eq!(entry.cleanup_scheduled_at, None);

        entry.transition(LifecycleState::CleaningUp).unwrap();
        entry.transition(LifecycleState::Expired).unwrap();
        entry.transition(LifecycleState::CleaningUp).unwrap();
        assert!(!entry.state.is_live());
    }

    #[test]
    fn test_time_checks() {
        let mut entry = entry();
        let start = entry.created_at;
        assert!(!entry.is_past_ttl(start + secs(59)));
        assert!(entry.is_past_ttl(start + secs(60)));

        entry.record_access(start + secs(10));
        assert_eq!(entry.access_count, 1);
        assert!(entry.accessed_within(start + secs(310), 300));
        assert!(!entry.accessed_within(start + secs(311), 300));

        assert!(!entry.is_cleanup_due(start));
        entry.cleanup_scheduled_at = Some(start + secs(30));
        assert!(entry.is_cleanup_due(start + secs(30)));
    }

    #[test]
    fn test_state_serde_names() {
        assert_eq!(
            serde_json::to_string(&LifecycleState::CleaningUp).unwrap(),
            "\"cleaning_up\""
        );
        assert_eq!(LifecycleState::CleaningUp.to_string(), "cleaning_up");
    }
}
