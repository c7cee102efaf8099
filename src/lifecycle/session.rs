//! Navigation Sessions
//!
//! Navigation events arrive from the surrounding application, at least once.
//! A session is created by the first event that names it and is dropped on
//! `session_end` or after going stale.

use crate::clock::secs;
use crate::optimizer::strategy::{compile_patterns, PATH_MATCH_OPTIONS};
use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of navigation event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationEventType {
    EnterContext,
    LeaveContext,
    EnterHub,
    LeaveHub,
    SessionStart,
    SessionEnd,
}

impl fmt::Display for NavigationEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NavigationEventType::EnterContext => "enter_context",
            NavigationEventType::LeaveContext => "leave_context",
            NavigationEventType::EnterHub => "enter_hub",
            NavigationEventType::LeaveHub => "leave_hub",
            NavigationEventType::SessionStart => "session_start",
            NavigationEventType::SessionEnd => "session_end",
        };
        f.write_str(name)
    }
}

/// One record of the navigation feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationEvent {
    pub session_id: String,
    pub user_id: String,
    pub event_type: NavigationEventType,
    pub current_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,
}

impl NavigationEvent {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        event_type: NavigationEventType,
        current_path: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            event_type,
            current_path: current_path.into(),
            previous_path: None,
        }
    }

    pub fn with_previous(mut self, previous_path: impl Into<String>) -> Self {
        self.previous_path = Some(previous_path.into());
        self
    }

    /// Context being left: the previous path when given, else the current one
    pub fn left_context(&self) -> &str {
        self.previous_path.as_deref().unwrap_or(&self.current_path)
    }
}

/// Navigation state of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationSession {
    pub session_id: String,
    pub user_id: String,
    pub current_path: String,
    pub previous_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Cache keys held on behalf of this session
    pub active_keys: BTreeSet<String>,
}

impl NavigationSession {
    pub fn new(event: &NavigationEvent, now: DateTime<Utc>) -> Self {
        Self {
            session_id: event.session_id.clone(),
            user_id: event.user_id.clone(),
            current_path: event.current_path.clone(),
            previous_path: event.previous_path.clone(),
            started_at: now,
            last_activity: now,
            active_keys: BTreeSet::new(),
        }
    }

    /// Apply a later event of the same session
    pub fn record(&mut self, event: &NavigationEvent, now: DateTime<Utc>) {
        let previous = std::mem::replace(&mut self.current_path, event.current_path.clone());
        self.previous_path = event.previous_path.clone().or(Some(previous));
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after_secs: u64) -> bool {
        now - self.last_activity > secs(stale_after_secs)
    }
}

// =============================================================================
// Context Classification
// =============================================================================

fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Whether `a` and `b` name the same work context, or one lies inside the other
pub fn contexts_overlap(a: &str, b: &str) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    if a == "/" || b == "/" {
        return a == b;
    }
    let nested = |outer: &str, inner: &str| {
        inner
            .strip_prefix(outer)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    };
    a == b || nested(a, b) || nested(b, a)
}

/// Recognizes hub/overview paths
#[derive(Debug, Clone)]
pub struct HubMatcher {
    patterns: Vec<Pattern>,
}

impl HubMatcher {
    pub fn new(hub_paths: &[String]) -> Self {
        Self {
            patterns: compile_patterns(hub_paths),
        }
    }

    pub fn is_hub(&self, path: &str) -> bool {
        let path = normalize(path);
        self.patterns
            .iter()
            .any(|p| p.matches_with(path, PATH_MATCH_OPTIONS))
    }

    /// A context that refers to a specific work item rather than an overview
    pub fn is_work_context(&self, path: &str) -> bool {
        !path.trim().is_empty() && !self.is_hub(path)
    }
}
