//! Lifecycle Coordinator
//!
//! Owns lifecycle entries and navigation sessions, turns navigation events
//! into cleanup decisions and runs the sweep and memory checks driven by the
//! engine's background loops.
//!
//! A navigation event mutates the entry and session maps under one lock and
//! returns; the cleanups it triggers run afterwards on a task tracker.
//! Cleanup releases the entry's store key and, when no other live entry
//! references the same repository, the repository's store keys and optimizer
//! state.

use crate::clock::{secs, ClockRef};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::lifecycle::entry::{LifecycleEntry, LifecycleState};
use crate::lifecycle::session::{contexts_overlap, HubMatcher, NavigationEvent, NavigationEventType, NavigationSession};
use crate::optimizer::AccessOptimizer;
use crate::store::entry::CacheKey;
use crate::store::TieredStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// Concurrent cleanups awaited by sweeps and forced cleanups
const CLEANUP_CONCURRENCY: usize = 8;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the lifecycle coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// TTL of a registered entry when none is given
    pub default_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub health_interval_secs: u64,
    /// Delay between leaving a context and cleaning its entries
    pub leave_grace_secs: u64,
    /// Entries accessed this recently survive entering a hub
    pub preserve_window_secs: u64,
    /// Expiry extension granted by the preserve path
    pub preserve_extension_secs: u64,
    /// Idle time after which a session is dropped
    pub stale_session_secs: u64,
    /// Remote memory usage that triggers aggressive cleanup
    pub high_water_bytes: u64,
    /// Share of entries (oldest first) removed by aggressive cleanup
    pub aggressive_cleanup_fraction: f64,
    /// Globs of hub/overview paths
    pub hub_paths: Vec<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            sweep_interval_secs: 10,
            health_interval_secs: 30,
            leave_grace_secs: 30,
            preserve_window_secs: 300,
            preserve_extension_secs: 600,
            stale_session_secs: 1800,
            high_water_bytes: 512 * 1024 * 1024,
            aggressive_cleanup_fraction: 0.5,
            hub_paths: ["/", "/dashboard", "/home", "/repos", "/repositories"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Result of handling one navigation event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationOutcome {
    pub session_id: String,
    pub event_type: NavigationEventType,
    /// Keys whose cleanup was started
    pub cleaned: Vec<String>,
    /// Keys kept alive by the preserve path
    pub preserved: Vec<String>,
    /// Keys with a delayed cleanup pending
    pub scheduled: Vec<String>,
    pub session_ended: bool,
}

impl NavigationOutcome {
    fn new(event: &NavigationEvent) -> Self {
        Self {
            session_id: event.session_id.clone(),
            event_type: event.event_type,
            cleaned: Vec::new(),
            preserved: Vec::new(),
            scheduled: Vec::new(),
            session_ended: false,
        }
    }
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Delayed cleanups that came due
    pub due: usize,
    /// Entries that passed their TTL
    pub expired: usize,
    /// Entries retried after an earlier failed cleanup
    pub retried: usize,
    pub sessions_removed: usize,
    pub cleaned: Vec<String>,
    pub failed: Vec<String>,
}

/// Result of a forced or aggressive cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub cleaned: Vec<String>,
    pub failed: Vec<String>,
    pub sessions_removed: usize,
}

/// Lifecycle counts for the introspection surface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleStatus {
    pub entries: usize,
    pub by_state: BTreeMap<LifecycleState, usize>,
    pub sessions: usize,
    pub pending_cleanups: usize,
    pub cleanups_in_flight: usize,
}

/// Key and repository of an entry whose cleanup has begun
type CleanupTicket = (String, String);

// =============================================================================
// Lifecycle Coordinator
// =============================================================================

pub struct LifecycleCoordinator {
    config: LifecycleConfig,
    hubs: HubMatcher,
    store: Arc<TieredStore>,
    optimizer: Arc<AccessOptimizer>,
    entries: DashMap<String, LifecycleEntry>,
    sessions: DashMap<String, NavigationSession>,
    /// Delayed cleanups ordered by due time
    delayed: Mutex<BTreeSet<(DateTime<Utc>, String)>>,
    /// Makes each navigation event and sweep decision one logical mutation
    navigation: Mutex<()>,
    tracker: TaskTracker,
    clock: ClockRef,
    events: EventBus,
}

impl LifecycleCoordinator {
    pub fn new(
        config: LifecycleConfig,
        store: Arc<TieredStore>,
        optimizer: Arc<AccessOptimizer>,
        clock: ClockRef,
        events: EventBus,
    ) -> Self {
        Self {
            hubs: HubMatcher::new(&config.hub_paths),
            config,
            store,
            optimizer,
            entries: DashMap::new(),
            sessions: DashMap::new(),
            delayed: Mutex::new(BTreeSet::new()),
            navigation: Mutex::new(()),
            tracker: TaskTracker::new(),
            clock,
            events,
        }
    }

    fn transition(&self, entry: &mut LifecycleEntry, next: LifecycleState) -> Result<LifecycleState> {
        let from = entry.transition(next)?;
        debug!(key = %entry.key, from = %from, to = %next, "Lifecycle transition");
        self.events.emit(EngineEvent::LifecycleTransition {
            key: entry.key.clone(),
            from: from.to_string(),
            to: next.to_string(),
        });
        Ok(from)
    }

    // =========================================================================
    // Registration and Access
    // =========================================================================

    /// Start tracking a cache key in `initializing`.
    ///
    /// Registering a live key again refreshes its owner, context and TTL.
    pub fn register_cache(
        &self,
        key: &str,
        user_id: &str,
        repository: &str,
        navigation_context: &str,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        if key.is_empty() || repository.is_empty() {
            return Err(Error::InvalidRepository(format!(
                "cannot register key '{}' for repository '{}'",
                key, repository
            )));
        }

        let now = self.clock.now();
        let ttl = ttl_secs.unwrap_or(self.config.default_ttl_secs);

        if let Some(mut existing) = self.entries.get_mut(key) {
            let state = existing.state;
            match state {
                state if state.is_live() => {
                    existing.user_id = user_id.to_string();
                    existing.repository = repository.to_string();
                    existing.navigation_context = navigation_context.to_string();
                    existing.expires_at = now + secs(ttl);
                    debug!(key = %key, "Refreshed lifecycle registration");
                    return Ok(());
                }
                LifecycleState::CleaningUp => {
                    return Err(Error::InvalidTransition {
                        key: key.to_string(),
                        from: LifecycleState::CleaningUp.to_string(),
                        to: LifecycleState::Initializing.to_string(),
                    });
                }
                // Expired or cleaned: start over below
                _ => {}
            }
        }

        self.entries.insert(
            key.to_string(),
            LifecycleEntry::new(key, user_id, repository, navigation_context, now, ttl),
        );
        debug!(key = %key, user_id = %user_id, repository = %repository, ttl_secs = ttl, "Registered cache entry");
        Ok(())
    }

    /// Move an entry from `initializing` to `active`
    pub fn activate(&self, key: &str) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if entry.state == LifecycleState::Active {
            return Ok(());
        }
        self.transition(entry.value_mut(), LifecycleState::Active)?;
        Ok(())
    }

    /// Record an access; an `expiring` entry returns to `active` with an
    /// extended expiry
    pub fn touch(&self, key: &str) -> Result<LifecycleState> {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        self.touch_entry(entry.value_mut(), now)?;
        Ok(entry.state)
    }

    /// Touch every live entry of a repository, returning how many were touched
    pub fn touch_repository(&self, repository: &str) -> usize {
        let now = self.clock.now();
        let mut touched = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.repository == repository && entry.state.is_live() {
                if self.touch_entry(entry.value_mut(), now).is_ok() {
                    touched += 1;
                }
            }
        }
        touched
    }

    fn touch_entry(&self, entry: &mut LifecycleEntry, now: DateTime<Utc>) -> Result<()> {
        match entry.state {
            LifecycleState::Active => {}
            LifecycleState::Initializing => {
                self.transition(entry, LifecycleState::Active)?;
            }
            LifecycleState::Expiring => {
                self.preserve(entry, now)?;
            }
            other => {
                return Err(Error::InvalidTransition {
                    key: entry.key.clone(),
                    from: other.to_string(),
                    to: LifecycleState::Active.to_string(),
                });
            }
        }
        entry.record_access(now);
        Ok(())
    }

    /// `expiring -> active`, cancelling any delayed cleanup
    fn preserve(&self, entry: &mut LifecycleEntry, now: DateTime<Utc>) -> Result<()> {
        self.transition(entry, LifecycleState::Active)?;
        let extended = now + secs(self.config.preserve_extension_secs);
        if extended > entry.expires_at {
            entry.expires_at = extended;
        }
        Ok(())
    }

    // =========================================================================
    // Navigation Events
    // =========================================================================

    /// Apply a navigation event.
    ///
    /// Never fails: cleanups it starts run in the background and report
    /// failures through events and the next sweep.
    #[instrument(skip(self, event), fields(session_id = %event.session_id, event_type = %event.event_type))]
    pub fn handle_navigation_event(self: &Arc<Self>, event: NavigationEvent) -> NavigationOutcome {
        let now = self.clock.now();
        let mut outcome = NavigationOutcome::new(&event);
        let mut tickets = Vec::new();

        {
            let _navigation = self.navigation.lock();

            if event.event_type == NavigationEventType::SessionEnd {
                outcome.session_ended = self.sessions.remove(&event.session_id).is_some();
            } else {
                self.sessions
                    .entry(event.session_id.clone())
                    .and_modify(|session| session.record(&event, now))
                    .or_insert_with(|| NavigationSession::new(&event, now));
            }

            match event.event_type {
                NavigationEventType::EnterHub => self.on_enter_hub(&event, now, &mut outcome, &mut tickets),
                NavigationEventType::LeaveContext => self.on_leave_context(&event, now, &mut outcome),
                NavigationEventType::EnterContext => self.on_enter_context(&event, now, &mut outcome),
                NavigationEventType::SessionEnd => {
                    for mut entry in self.entries.iter_mut() {
                        if entry.user_id == event.user_id {
                            if let Some(ticket) = self.begin_cleanup(entry.value_mut()) {
                                tickets.push(ticket);
                            }
                        }
                    }
                }
                NavigationEventType::SessionStart | NavigationEventType::LeaveHub => {}
            }

            self.refresh_active_keys(&event.session_id, &event.user_id);
        }

        outcome.cleaned = tickets.iter().map(|(key, _)| key.clone()).collect();
        for (key, repository) in tickets {
            let coordinator = Arc::clone(self);
            self.tracker.spawn(async move {
                coordinator.finish_cleanup(&key, &repository).await;
            });
        }

        debug!(
            cleaned = outcome.cleaned.len(),
            preserved = outcome.preserved.len(),
            scheduled = outcome.scheduled.len(),
            "Handled navigation event"
        );
        outcome
    }

    fn on_enter_hub(
        &self,
        event: &NavigationEvent,
        now: DateTime<Utc>,
        outcome: &mut NavigationOutcome,
        tickets: &mut Vec<CleanupTicket>,
    ) {
        for mut entry in self.entries.iter_mut() {
            if entry.user_id != event.user_id
                || !entry.state.is_live()
                || !self.hubs.is_work_context(&entry.navigation_context)
            {
                continue;
            }

            if entry.accessed_within(now, self.config.preserve_window_secs) {
                if entry.state != LifecycleState::Expiring
                    && self.transition(entry.value_mut(), LifecycleState::Expiring).is_err()
                {
                    continue;
                }
                entry.expires_at = now + secs(self.config.preserve_extension_secs);
                entry.cleanup_scheduled_at = None;
                outcome.preserved.push(entry.key.clone());
            } else if let Some(ticket) = self.begin_cleanup(entry.value_mut()) {
                tickets.push(ticket);
            }
        }
    }

    fn on_leave_context(&self, event: &NavigationEvent, now: DateTime<Utc>, outcome: &mut NavigationOutcome) {
        let context = event.left_context();
        let due = now + secs(self.config.leave_grace_secs);

        for mut entry in self.entries.iter_mut() {
            if entry.user_id != event.user_id
                || !entry.state.is_live()
                || !contexts_overlap(&entry.navigation_context, context)
            {
                continue;
            }

            // Redelivery keeps the original deadline
            if entry.cleanup_scheduled_at.is_none() {
                if entry.state != LifecycleState::Expiring
                    && self.transition(entry.value_mut(), LifecycleState::Expiring).is_err()
                {
                    continue;
                }
                entry.cleanup_scheduled_at = Some(due);
                self.delayed.lock().insert((due, entry.key.clone()));
            }
            outcome.scheduled.push(entry.key.clone());
        }
    }

    fn on_enter_context(&self, event: &NavigationEvent, now: DateTime<Utc>, outcome: &mut NavigationOutcome) {
        for mut entry in self.entries.iter_mut() {
            if entry.user_id == event.user_id
                && entry.state == LifecycleState::Expiring
                && contexts_overlap(&entry.navigation_context, &event.current_path)
                && self.preserve(entry.value_mut(), now).is_ok()
            {
                entry.record_access(now);
                outcome.preserved.push(entry.key.clone());
            }
        }
    }

    fn refresh_active_keys(&self, session_id: &str, user_id: &str) {
        let keys: BTreeSet<String> = self
            .entries
            .iter()
            .filter(|entry| entry.user_id == user_id && entry.state.is_live())
            .map(|entry| entry.key().clone())
            .collect();
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.active_keys = keys;
        }
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Move an entry into `cleaning_up`; `None` if it is already on its way out
    fn begin_cleanup(&self, entry: &mut LifecycleEntry) -> Option<CleanupTicket> {
        if !entry.state.can_transition_to(LifecycleState::CleaningUp) {
            return None;
        }
        self.transition(entry, LifecycleState::CleaningUp).ok()?;
        Some((entry.key.clone(), entry.repository.clone()))
    }

    /// Release an entry's resources. On failure the entry is parked in
    /// `expired` for the next sweep.
    async fn finish_cleanup(&self, key: &str, repository: &str) -> bool {
        let shared = self
            .entries
            .iter()
            .any(|entry| entry.key() != key && entry.repository == repository && entry.state.is_live());

        match self.release_resources(key, repository, shared).await {
            Ok(()) => {
                if let Some(mut entry) = self.entries.get_mut(key) {
                    if entry.state == LifecycleState::CleaningUp {
                        // Checked above; cannot fail
                        let _ = self.transition(entry.value_mut(), LifecycleState::Cleaned);
                    }
                }
                self.entries
                    .remove_if(key, |_, entry| entry.state == LifecycleState::Cleaned);
                for mut session in self.sessions.iter_mut() {
                    session.active_keys.remove(key);
                }
                debug!(key = %key, repository = %repository, shared, "Cache entry cleaned");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cleanup failed, will retry on next sweep");
                if let Some(mut entry) = self.entries.get_mut(key) {
                    if entry.state == LifecycleState::CleaningUp {
                        let _ = self.transition(entry.value_mut(), LifecycleState::Expired);
                    }
                }
                self.events.emit(EngineEvent::CleanupFailed {
                    key: key.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    async fn release_resources(&self, key: &str, repository: &str, shared: bool) -> Result<()> {
        self.store.delete(key).await?;
        if !shared {
            self.optimizer.cleanup_repository(repository).await;
            self.store
                .delete_prefix(&CacheKey::repo_prefix(repository))
                .await?;
        }
        Ok(())
    }

    async fn run_cleanups(&self, tickets: Vec<CleanupTicket>) -> (Vec<String>, Vec<String>) {
        let results: Vec<(String, bool)> = stream::iter(tickets)
            .map(|(key, repository)| async move {
                let cleaned = self.finish_cleanup(&key, &repository).await;
                (key, cleaned)
            })
            .buffer_unordered(CLEANUP_CONCURRENCY)
            .collect()
            .await;

        let mut cleaned = Vec::new();
        let mut failed = Vec::new();
        for (key, ok) in results {
            if ok {
                cleaned.push(key);
            } else {
                failed.push(key);
            }
        }
        cleaned.sort();
        failed.sort();
        (cleaned, failed)
    }

    /// Wait for background cleanups started by navigation events
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Run due delayed cleanups, expire entries past their TTL, retry failed
    /// cleanups and drop stale sessions along with their entries
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        let mut tickets = Vec::new();

        {
            let _navigation = self.navigation.lock();

            let due: Vec<(DateTime<Utc>, String)> = {
                let mut delayed = self.delayed.lock();
                let mut due = Vec::new();
                while delayed.first().map(|(at, _)| *at <= now).unwrap_or(false) {
                    if let Some(item) = delayed.pop_first() {
                        due.push(item);
                    }
                }
                due
            };
            for (at, key) in due {
                if let Some(mut entry) = self.entries.get_mut(&key) {
                    // Preserved entries no longer carry this deadline
                    if entry.state == LifecycleState::Expiring && entry.cleanup_scheduled_at == Some(at) {
                        if let Some(ticket) = self.begin_cleanup(entry.value_mut()) {
                            report.due += 1;
                            tickets.push(ticket);
                        }
                    }
                }
            }

            for mut entry in self.entries.iter_mut() {
                let state = entry.state;
                match state {
                    state if state.is_live() && entry.is_past_ttl(now) => {
                        if self.transition(entry.value_mut(), LifecycleState::Expired).is_ok() {
                            report.expired += 1;
                        }
                    }
                    LifecycleState::Expired => report.retried += 1,
                    _ => continue,
                }
                if let Some(ticket) = self.begin_cleanup(entry.value_mut()) {
                    tickets.push(ticket);
                }
            }

            let stale: Vec<String> = self
                .sessions
                .iter()
                .filter(|session| session.is_stale(now, self.config.stale_session_secs))
                .map(|session| session.key().clone())
                .collect();
            let mut orphaned: HashSet<String> = HashSet::new();
            for session_id in stale {
                if let Some((_, session)) = self.sessions.remove(&session_id) {
                    info!(
                        session_id = %session_id,
                        user_id = %session.user_id,
                        active_keys = session.active_keys.len(),
                        "Dropping stale session"
                    );
                    report.sessions_removed += 1;
                    orphaned.extend(session.active_keys);
                }
            }
            // Keys still held by a remaining session stay
            for session in self.sessions.iter() {
                orphaned.retain(|key| !session.active_keys.contains(key));
            }
            for key in orphaned {
                if let Some(mut entry) = self.entries.get_mut(&key) {
                    if let Some(ticket) = self.begin_cleanup(entry.value_mut()) {
                        tickets.push(ticket);
                    }
                }
            }
        }

        let (cleaned, failed) = self.run_cleanups(tickets).await;
        report.cleaned = cleaned;
        report.failed = failed;

        if !report.cleaned.is_empty() || !report.failed.is_empty() || report.sessions_removed > 0 {
            info!(
                due = report.due,
                expired = report.expired,
                retried = report.retried,
                sessions_removed = report.sessions_removed,
                cleaned = report.cleaned.len(),
                failed = report.failed.len(),
                "Lifecycle sweep complete"
            );
        }
        report
    }

    // =========================================================================
    // Memory Pressure
    // =========================================================================

    /// Read remote memory usage and clean aggressively above the high-water mark
    pub async fn check_memory(&self) -> Result<Option<CleanupSummary>> {
        let used_bytes = self.store.memory_usage().await?;
        if used_bytes <= self.config.high_water_bytes {
            debug!(used_bytes, high_water_bytes = self.config.high_water_bytes, "Memory below high-water mark");
            return Ok(None);
        }
        Ok(Some(self.aggressive_cleanup(used_bytes).await))
    }

    /// Force-clean the least recently accessed share of entries regardless
    /// of navigation state
    pub async fn aggressive_cleanup(&self, used_bytes: u64) -> CleanupSummary {
        let tickets = {
            let _navigation = self.navigation.lock();
            let mut candidates: Vec<(DateTime<Utc>, String)> = self
                .entries
                .iter()
                .filter(|entry| entry.state.can_transition_to(LifecycleState::CleaningUp))
                .map(|entry| (entry.last_accessed, entry.key().clone()))
                .collect();
            candidates.sort();

            let count = ((candidates.len() as f64) * self.config.aggressive_cleanup_fraction).ceil() as usize;
            let mut tickets = Vec::with_capacity(count);
            for (_, key) in candidates.into_iter().take(count) {
                if let Some(mut entry) = self.entries.get_mut(&key) {
                    if let Some(ticket) = self.begin_cleanup(entry.value_mut()) {
                        tickets.push(ticket);
                    }
                }
            }
            tickets
        };

        let (cleaned, failed) = self.run_cleanups(tickets).await;
        warn!(
            used_bytes,
            high_water_bytes = self.config.high_water_bytes,
            entries_cleaned = cleaned.len(),
            "Aggressive cleanup under memory pressure"
        );
        self.events.emit(EngineEvent::AggressiveCleanup {
            used_bytes,
            entries_cleaned: cleaned.len(),
        });
        CleanupSummary {
            cleaned,
            failed,
            sessions_removed: 0,
        }
    }

    /// Clean every entry and drop every session of a user, waiting for the
    /// cleanups to finish
    pub async fn force_cleanup_user(&self, user_id: &str) -> CleanupSummary {
        let (tickets, sessions_removed) = {
            let _navigation = self.navigation.lock();
            let before = self.sessions.len();
            self.sessions.retain(|_, session| session.user_id != user_id);
            let sessions_removed = before - self.sessions.len();

            let mut tickets = Vec::new();
            for mut entry in self.entries.iter_mut() {
                if entry.user_id == user_id {
                    if let Some(ticket) = self.begin_cleanup(entry.value_mut()) {
                        tickets.push(ticket);
                    }
                }
            }
            (tickets, sessions_removed)
        };

        let (cleaned, failed) = self.run_cleanups(tickets).await;
        info!(user_id = %user_id, cleaned = cleaned.len(), failed = failed.len(), sessions_removed, "Forced user cleanup");
        CleanupSummary {
            cleaned,
            failed,
            sessions_removed,
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn entry(&self, key: &str) -> Option<LifecycleEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    pub fn state(&self, key: &str) -> Option<LifecycleState> {
        self.entries.get(key).map(|entry| entry.state)
    }

    pub fn session(&self, session_id: &str) -> Option<NavigationSession> {
        self.sessions.get(session_id).map(|session| session.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn status(&self) -> LifecycleStatus {
        let mut by_state = BTreeMap::new();
        for entry in self.entries.iter() {
            *by_state.entry(entry.state).or_insert(0) += 1;
        }
        LifecycleStatus {
            entries: self.entries.len(),
            by_state,
            sessions: self.sessions.len(),
            pending_cleanups: self.delayed.lock().len(),
            cleanups_in_flight: self.tracker.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::optimizer::{CacheStrategy, OptimizerConfig, RepoFile, StaticSource};
    use crate::store::remote::InMemoryRemoteStore;
    use crate::store::StoreConfig;

    const REPO: &str = "acme/widgets";
    const KEY: &str = "repo:acme/widgets:tree";
    const CONTEXT: &str = "/repos/acme/widgets";

    struct Fixture {
        coordinator: Arc<LifecycleCoordinator>,
        optimizer: Arc<AccessOptimizer>,
        store: Arc<TieredStore>,
        remote: Arc<InMemoryRemoteStore>,
        clock: Arc<ManualClock>,
        events: EventBus,
    }

    fn fixture(config: LifecycleConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let events = EventBus::new(512);
        let remote = Arc::new(InMemoryRemoteStore::new(clock.clone()));
        let store = Arc::new(TieredStore::new(
            StoreConfig::default(),
            remote.clone(),
            clock.clone(),
            events.clone(),
        ));
        let source = Arc::new(StaticSource::new());
        source.insert(REPO, "README.md", "# widgets");
        let optimizer = Arc::new(AccessOptimizer::new(
            OptimizerConfig::default(),
            store.clone(),
            source,
            clock.clone(),
            events.clone(),
        ));
        let coordinator = Arc::new(LifecycleCoordinator::new(
            config,
            store.clone(),
            optimizer.clone(),
            clock.clone(),
            events.clone(),
        ));
        Fixture {
            coordinator,
            optimizer,
            store,
            remote,
            clock,
            events,
        }
    }

    async fn register(f: &Fixture, key: &str, user: &str, repository: &str, context: &str) {
        f.store.set(key, "{}", None).await.unwrap();
        f.coordinator
            .register_cache(key, user, repository, context, None)
            .unwrap();
        f.coordinator.activate(key).unwrap();
    }

    fn event(kind: NavigationEventType, path: &str) -> NavigationEvent {
        NavigationEvent::new("s1", "u1", kind, path)
    }

    #[tokio::test]
    async fn test_register_activate_touch() {
        let f = fixture(LifecycleConfig::default());
        f.coordinator
            .register_cache(KEY, "u1", REPO, CONTEXT, Some(60))
            .unwrap();
        assert_eq!(f.coordinator.state(KEY), Some(LifecycleState::Initializing));

        f.coordinator.activate(KEY).unwrap();
        f.coordinator.activate(KEY).unwrap();
        assert_eq!(f.coordinator.touch(KEY).unwrap(), LifecycleState::Active);
        assert_eq!(f.coordinator.entry(KEY).unwrap().access_count, 1);

        assert!(matches!(f.coordinator.touch("missing"), Err(Error::NotFound(_))));
        assert!(matches!(
            f.coordinator.register_cache(KEY, "u1", "", CONTEXT, None),
            Err(Error::InvalidRepository(_))
        ));
    }

    #[tokio::test]
    async fn test_leave_context_cleans_after_grace() {
        let f = fixture(LifecycleConfig::default());
        register(&f, KEY, "u1", REPO, CONTEXT).await;

        let outcome = f
            .coordinator
            .handle_navigation_event(event(NavigationEventType::LeaveContext, "/dashboard").with_previous(CONTEXT));
        assert_eq!(outcome.scheduled, vec![KEY]);
        assert_eq!(f.coordinator.state(KEY), Some(LifecycleState::Expiring));

        // Redelivery keeps the original deadline
        f.clock.advance(secs(10));
        f.coordinator
            .handle_navigation_event(event(NavigationEventType::LeaveContext, "/dashboard").with_previous(CONTEXT));

        f.clock.advance(secs(15));
        let report = f.coordinator.sweep().await;
        assert!(report.cleaned.is_empty());

        f.clock.advance(secs(6));
        let report = f.coordinator.sweep().await;
        assert_eq!(report.due, 1);
        assert_eq!(report.cleaned, vec![KEY]);
        assert_eq!(f.coordinator.state(KEY), None);
        assert!(f.remote.raw(KEY).is_none());
    }

    #[tokio::test]
    async fn test_returning_within_grace_preserves_entry() {
        let f = fixture(LifecycleConfig::default());
        register(&f, KEY, "u1", REPO, CONTEXT).await;

        f.coordinator
            .handle_navigation_event(event(NavigationEventType::LeaveContext, CONTEXT));
        f.clock.advance(secs(10));
        let outcome = f
            .coordinator
            .handle_navigation_event(event(NavigationEventType::EnterContext, "/repos/acme/widgets/blob/README.md"));
        assert_eq!(outcome.preserved, vec![KEY]);
        assert_eq!(f.coordinator.state(KEY), Some(LifecycleState::Active));

        f.clock.advance(secs(60));
        let report = f.coordinator.sweep().await;
        assert!(report.cleaned.is_empty());
        assert_eq!(report.due, 0);
        assert_eq!(f.coordinator.state(KEY), Some(LifecycleState::Active));
    }

    #[tokio::test]
    async fn test_enter_hub_preserve_window() {
        let f = fixture(LifecycleConfig::default());
        register(&f, "repo:acme/old:tree", "u1", "acme/old", "/repos/acme/old").await;
        f.clock.advance(secs(400));
        register(&f, KEY, "u1", REPO, CONTEXT).await;
        f.coordinator.touch(KEY).unwrap();
        register(&f, "repo:acme/home:tree", "u1", "acme/home", "/dashboard").await;

        f.clock.advance(secs(60));
        let outcome = f
            .coordinator
            .handle_navigation_event(event(NavigationEventType::EnterHub, "/dashboard"));
        f.coordinator.flush().await;

        assert_eq!(outcome.preserved, vec![KEY]);
        assert_eq!(outcome.cleaned, vec!["repo:acme/old:tree"]);
        assert_eq!(f.coordinator.state(KEY), Some(LifecycleState::Expiring));
        assert_eq!(f.coordinator.state("repo:acme/old:tree"), None);
        // Hub-scoped entries are left alone
        assert_eq!(f.coordinator.state("repo:acme/home:tree"), Some(LifecycleState::Active));

        // Preserved entries expire after the extension unless touched
        f.clock.advance(secs(601));
        let report = f.coordinator.sweep().await;
        assert_eq!(report.cleaned, vec![KEY]);
    }

    #[tokio::test]
    async fn test_session_end_cleans_user_entries() {
        let f = fixture(LifecycleConfig::default());
        register(&f, KEY, "u1", REPO, CONTEXT).await;
        register(&f, "repo:acme/gadgets:tree", "u2", "acme/gadgets", "/repos/acme/gadgets").await;

        f.coordinator
            .handle_navigation_event(event(NavigationEventType::SessionStart, "/dashboard"));
        assert_eq!(
            f.coordinator.session("s1").unwrap().active_keys,
            BTreeSet::from([KEY.to_string()])
        );

        let outcome = f
            .coordinator
            .handle_navigation_event(event(NavigationEventType::SessionEnd, "/logout"));
        f.coordinator.flush().await;
        assert!(outcome.session_ended);
        assert_eq!(outcome.cleaned, vec![KEY]);
        assert_eq!(f.coordinator.state(KEY), None);
        assert_eq!(f.coordinator.session_count(), 0);
        assert_eq!(
            f.coordinator.state("repo:acme/gadgets:tree"),
            Some(LifecycleState::Active)
        );

        // Redelivery is harmless
        let again = f
            .coordinator
            .handle_navigation_event(event(NavigationEventType::SessionEnd, "/logout"));
        assert!(!again.session_ended);
        assert!(again.cleaned.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_ttl_does_not_expire_immediately() {
        let f = fixture(LifecycleConfig::default());
        f.coordinator
            .register_cache(KEY, "u1", REPO, CONTEXT, Some(u64::MAX))
            .unwrap();
        f.coordinator
            .register_cache("repo:acme/tools:tree", "u1", "acme/tools", "/repos/acme/tools", Some(1 << 60))
            .unwrap();

        let report = f.coordinator.sweep().await;
        assert_eq!(report.expired, 0);
        assert!(report.cleaned.is_empty());
        assert_eq!(f.coordinator.state(KEY), Some(LifecycleState::Initializing));
    }

    #[tokio::test]
    async fn test_force_cleanup_user() {
        let f = fixture(LifecycleConfig::default());
        register(&f, KEY, "u1", REPO, CONTEXT).await;
        register(&f, "repo:acme/tools:tree", "u1", "acme/tools", "/repos/acme/tools").await;
        register(&f, "repo:acme/gadgets:tree", "u2", "acme/gadgets", "/repos/acme/gadgets").await;
        f.coordinator
            .handle_navigation_event(event(NavigationEventType::SessionStart, "/dashboard"));

        let summary = f.coordinator.force_cleanup_user("u1").await;
        assert_eq!(summary.cleaned, vec!["repo:acme/tools:tree", KEY]);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.sessions_removed, 1);
        assert!(f.remote.raw(KEY).is_none());
        assert_eq!(
            f.coordinator.state("repo:acme/gadgets:tree"),
            Some(LifecycleState::Active)
        );
    }

    #[tokio::test]
    async fn test_stale_session_cascades() {
        let f = fixture(LifecycleConfig::default());
        let mut rx = f.events.subscribe();
        register(&f, KEY, "u1", REPO, CONTEXT).await;
        f.coordinator
            .handle_navigation_event(event(NavigationEventType::EnterContext, CONTEXT));

        f.clock.advance(secs(1801));
        let report = f.coordinator.sweep().await;
        assert_eq!(report.sessions_removed, 1);
        assert_eq!(report.cleaned, vec![KEY]);
        assert_eq!(f.coordinator.session_count(), 0);

        let mut reached_cleaned = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::LifecycleTransition { key, to, .. } = event {
                reached_cleaned |= key == KEY && to == "cleaned";
            }
        }
        assert!(reached_cleaned);
    }

    #[tokio::test]
    async fn test_stale_session_spares_keys_of_live_sessions() {
        let f = fixture(LifecycleConfig::default());
        register(&f, KEY, "u1", REPO, CONTEXT).await;
        f.coordinator
            .handle_navigation_event(event(NavigationEventType::EnterContext, CONTEXT));

        f.clock.advance(secs(1000));
        f.coordinator.handle_navigation_event(NavigationEvent::new(
            "s2",
            "u1",
            NavigationEventType::EnterContext,
            CONTEXT,
        ));

        f.clock.advance(secs(1000));
        let report = f.coordinator.sweep().await;
        assert_eq!(report.sessions_removed, 1);
        assert!(report.cleaned.is_empty());
        assert!(f.coordinator.session("s1").is_none());
        assert_eq!(f.coordinator.state(KEY), Some(LifecycleState::Active));

        f.clock.advance(secs(1000));
        let report = f.coordinator.sweep().await;
        assert_eq!(report.sessions_removed, 1);
        assert_eq!(report.cleaned, vec![KEY]);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let f = fixture(LifecycleConfig::default());
        f.coordinator
            .register_cache(KEY, "u1", REPO, CONTEXT, Some(120))
            .unwrap();

        f.clock.advance(secs(119));
        assert_eq!(f.coordinator.sweep().await.expired, 0);

        f.clock.advance(secs(1));
        let report = f.coordinator.sweep().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.cleaned, vec![KEY]);
    }

    #[tokio::test]
    async fn test_failed_cleanup_is_retried() {
        let f = fixture(LifecycleConfig::default());
        register(&f, KEY, "u1", REPO, CONTEXT).await;

        f.remote.set_available(false);
        let summary = f.coordinator.force_cleanup_user("u1").await;
        assert_eq!(summary.failed, vec![KEY]);
        assert_eq!(f.coordinator.state(KEY), Some(LifecycleState::Expired));

        f.remote.set_available(true);
        let report = f.coordinator.sweep().await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.cleaned, vec![KEY]);
        assert_eq!(f.coordinator.state(KEY), None);
    }

    #[tokio::test]
    async fn test_shared_repository_survives_partial_cleanup() {
        let f = fixture(LifecycleConfig::default());
        f.optimizer
            .initialize_repository(REPO, vec![RepoFile::new("README.md", Some(9))], CacheStrategy::Lazy)
            .await
            .unwrap();
        register(&f, KEY, "u1", REPO, CONTEXT).await;
        register(&f, "repo:acme/widgets:branches", "u2", REPO, CONTEXT).await;

        f.coordinator.force_cleanup_user("u1").await;
        assert!(f.optimizer.is_initialized(REPO));
        assert!(f.remote.raw("repo:acme/widgets:branches").is_some());

        f.coordinator.force_cleanup_user("u2").await;
        assert!(!f.optimizer.is_initialized(REPO));
        assert!(f.remote.raw("repo:acme/widgets:file:README.md").is_none());
    }

    #[tokio::test]
    async fn test_aggressive_cleanup_takes_oldest_half() {
        let config = LifecycleConfig {
            high_water_bytes: 1,
            ..Default::default()
        };
        let f = fixture(config);
        for i in 0..4 {
            let key = format!("repo:acme/r{}:tree", i);
            register(&f, &key, "u1", &format!("acme/r{}", i), "/dashboard").await;
            f.clock.advance(secs(1));
        }

        let summary = f.coordinator.check_memory().await.unwrap().unwrap();
        assert_eq!(summary.cleaned, vec!["repo:acme/r0:tree", "repo:acme/r1:tree"]);
        assert_eq!(f.coordinator.status().entries, 2);

        let status = f.coordinator.status();
        assert_eq!(status.by_state.get(&LifecycleState::Active), Some(&2));
    }

    #[tokio::test]
    async fn test_memory_below_high_water_does_nothing() {
        let f = fixture(LifecycleConfig::default());
        register(&f, KEY, "u1", REPO, CONTEXT).await;
        assert!(f.coordinator.check_memory().await.unwrap().is_none());
        assert_eq!(f.coordinator.state(KEY), Some(LifecycleState::Active));
    }
}
