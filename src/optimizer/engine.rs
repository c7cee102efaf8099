//! Access Optimizer
//!
//! Request-path reads over the resident virtual files, repository
//! initialization with strategy-driven preloading, memory enforcement and the
//! periodic optimization pass.
//!
//! Virtual files and repository indexes live in sharded maps so unrelated
//! repositories never contend on one lock. No map guard is held across a
//! store or source call.

use crate::clock::{secs, ClockRef};
use crate::error::{BestEffort, Error, Result};
use crate::events::{EngineEvent, EventBus, EvictionReason};
use crate::optimizer::file::{detect_language, FileContent, VirtualFile};
use crate::optimizer::pattern::AccessMetrics;
use crate::optimizer::prefetch::{related_files, PrefetchRequest, PrefetchStatsSnapshot, Prefetcher};
use crate::optimizer::source::ContentSource;
use crate::optimizer::strategy::{select_adaptive, CacheStrategy, RepoFile, PATH_MATCH_OPTIONS};
use crate::optimizer::OptimizerConfig;
use crate::store::compression::CompressionManager;
use crate::store::entry::CacheKey;
use crate::store::tiered::TieredStore;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use glob::Pattern;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// (repository, path)
type FileId = (String, String);

/// Known files and strategy of one repository
struct RepositoryIndex {
    files: BTreeSet<String>,
    /// Strategy requested at initialization
    strategy: CacheStrategy,
    /// Strategy currently applied; differs from `strategy` only for adaptive
    effective: CacheStrategy,
    initialized_at: DateTime<Utc>,
    hits: AtomicU64,
    misses: AtomicU64,
}

// =============================================================================
// Reports
// =============================================================================

/// Result of [`AccessOptimizer::initialize_repository`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeReport {
    pub repository: String,
    pub known_files: usize,
    /// Files chosen by the strategy
    pub selected: Vec<String>,
    pub preloaded: usize,
    /// Selected files the source did not have
    pub missing: usize,
    pub failed: usize,
}

/// Result of one periodic optimization pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationSummary {
    pub expired_removed: usize,
    pub overflow_evicted: usize,
    pub strategy_changes: usize,
}

/// Result of [`AccessOptimizer::cleanup_repository`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryCleanup {
    pub repository: String,
    pub was_initialized: bool,
    pub files_removed: u64,
    pub bytes_released: u64,
    pub prefetch_dropped: usize,
}

/// Per-repository view for the introspection surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStatus {
    pub repository: String,
    pub strategy: CacheStrategy,
    pub effective_strategy: CacheStrategy,
    pub initialized_at: DateTime<Utc>,
    pub known_files: usize,
    pub resident_files: usize,
    pub resident_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub pending_prefetch: usize,
}

/// Aggregate optimizer status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStatus {
    pub repositories: Vec<RepositoryStatus>,
    pub resident_files: usize,
    pub resident_bytes: u64,
    pub memory_ceiling_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
    pub pending_prefetch: usize,
    pub prefetch: PrefetchStatsSnapshot,
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

// =============================================================================
// Access Optimizer
// =============================================================================

/// Per-repository file index and resident virtual files
pub struct AccessOptimizer {
    config: OptimizerConfig,
    store: Arc<TieredStore>,
    source: Arc<dyn ContentSource>,
    compression: CompressionManager,
    prefetcher: Prefetcher,
    repositories: DashMap<String, RepositoryIndex>,
    files: DashMap<FileId, VirtualFile>,
    resident_bytes: AtomicU64,
    /// Held only by admissions that must evict; reservations are atomic
    eviction: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    clock: ClockRef,
    events: EventBus,
}

impl AccessOptimizer {
    pub fn new(
        config: OptimizerConfig,
        store: Arc<TieredStore>,
        source: Arc<dyn ContentSource>,
        clock: ClockRef,
        events: EventBus,
    ) -> Self {
        let compression = CompressionManager::with_config(store.config().compression.clone());
        let prefetcher = Prefetcher::with_config(config.prefetch.clone());
        Self {
            config,
            store,
            source,
            compression,
            prefetcher,
            repositories: DashMap::new(),
            files: DashMap::new(),
            resident_bytes: AtomicU64::new(0),
            eviction: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            clock,
            events,
        }
    }

    // =========================================================================
    // Repository Initialization
    // =========================================================================

    /// Record a repository's files and preload the subset chosen by `strategy`.
    ///
    /// Re-initializing replaces the known file set and strategy; resident
    /// files no longer in the set are dropped. Preload failures are skipped.
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub async fn initialize_repository(
        &self,
        repository: &str,
        files: Vec<RepoFile>,
        strategy: CacheStrategy,
    ) -> Result<InitializeReport> {
        if repository.is_empty() {
            return Err(Error::InvalidRepository("empty repository key".to_string()));
        }

        let selected = strategy.initial_selection(&files, &self.config.strategy);
        let known: BTreeSet<String> = files.into_iter().map(|f| f.path).collect();
        let known_files = known.len();

        {
            self.files
                .retain(|(repo, path), file| {
                    if repo == repository && !known.contains(path) {
                        self.resident_bytes.fetch_sub(file.resident_bytes(), Ordering::Relaxed);
                        false
                    } else {
                        true
                    }
                });
            self.repositories.insert(
                repository.to_string(),
                RepositoryIndex {
                    files: known,
                    strategy,
                    effective: match strategy {
                        CacheStrategy::Adaptive => CacheStrategy::Predictive,
                        other => other,
                    },
                    initialized_at: self.clock.now(),
                    hits: AtomicU64::new(0),
                    misses: AtomicU64::new(0),
                },
            );
        }

        let mut report = InitializeReport {
            repository: repository.to_string(),
            known_files,
            selected: selected.clone(),
            ..Default::default()
        };

        let outcomes: Vec<(String, Result<bool>)> = stream::iter(selected)
            .map(|path| async move {
                let outcome = self.preload(repository, &path).await;
                (path, outcome)
            })
            .buffer_unordered(self.config.preload_concurrency.max(1))
            .collect()
            .await;

        for (path, outcome) in outcomes {
            match outcome {
                Ok(true) => report.preloaded += 1,
                Ok(false) => report.missing += 1,
                Err(e) => {
                    warn!(repository = %repository, path = %path, error = %e, "Preload failed, skipping");
                    report.failed += 1;
                }
            }
        }

        info!(
            repository = %repository,
            strategy = %strategy,
            known_files,
            preloaded = report.preloaded,
            failed = report.failed,
            "Repository initialized"
        );
        Ok(report)
    }

    /// Fetch one file from the source into the tiered store
    async fn preload(&self, repository: &str, path: &str) -> Result<bool> {
        let Some(text) = self.source.fetch(repository, path).await? else {
            return Ok(false);
        };
        let key = CacheKey::file(repository, path);
        self.store
            .set(key.as_str(), text, Some(self.config.file_ttl_secs))
            .await?;
        Ok(true)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read a file of an initialized repository.
    ///
    /// Returns `Ok(None)` for paths outside the known file set and for files
    /// that cannot be fetched; store and source failures are logged, never
    /// returned.
    pub async fn get_file_content(&self, repository: &str, path: &str) -> Result<Option<FileContent>> {
        {
            let index = self
                .repositories
                .get(repository)
                .ok_or_else(|| Error::InvalidRepository(repository.to_string()))?;
            if !index.files.contains(path) {
                debug!(repository = %repository, path = %path, "Rejected read of unknown path");
                return Ok(None);
            }
        }

        let id: FileId = (repository.to_string(), path.to_string());
        let now = self.clock.now();

        if let Some(content) = self.read_resident(&id, now) {
            self.record_lookup(repository, true);
            return Ok(Some(content));
        }
        self.record_lookup(repository, false);

        let key = CacheKey::file(repository, path);
        let stored = match self.store.get(key.as_str()).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(key = %key, error = %e, "Tiered store read failed, falling back to source");
                None
            }
        };

        let text = match stored {
            Some(text) => text,
            None => match self.source.fetch(repository, path).await {
                Ok(Some(text)) => {
                    self.store
                        .set(key.as_str(), text.clone(), Some(self.config.file_ttl_secs))
                        .await
                        .best_effort("store fetched file");
                    text
                }
                Ok(None) => {
                    debug!(repository = %repository, path = %path, "File not found at source");
                    return Ok(None);
                }
                Err(e) => {
                    warn!(repository = %repository, path = %path, error = %e, "Source fetch failed");
                    return Ok(None);
                }
            },
        };

        let expires_at = Some(now + secs(self.config.file_ttl_secs));
        match VirtualFile::new(path, text.clone(), &self.compression, now, expires_at, false) {
            Ok(file) => {
                if let Err(e) = self.admit(id, file) {
                    warn!(repository = %repository, path = %path, error = %e, "File not kept resident");
                }
            }
            Err(e) => warn!(repository = %repository, path = %path, error = %e, "Could not build virtual file"),
        }

        self.schedule_prefetch(repository, path).await;

        Ok(Some(FileContent {
            repository: repository.to_string(),
            path: path.to_string(),
            size_bytes: text.len() as u64,
            language: detect_language(path).map(String::from),
            content: text,
            from_memory: false,
        }))
    }

    /// Serve a resident, unexpired file and record the access
    fn read_resident(&self, id: &FileId, now: DateTime<Utc>) -> Option<FileContent> {
        let stale = match self.files.get_mut(id) {
            None => return None,
            Some(mut file) => {
                if file.is_expired(now) {
                    true
                } else {
                    match file.text(&self.compression) {
                        Ok(text) => {
                            let size = file.size_bytes;
                            file.metrics.record_access(now, size, true, &self.config.patterns);
                            return Some(FileContent {
                                repository: id.0.clone(),
                                path: id.1.clone(),
                                content: text,
                                language: file.language.map(String::from),
                                size_bytes: size,
                                from_memory: true,
                            });
                        }
                        Err(e) => {
                            warn!(repository = %id.0, path = %id.1, error = %e, "Dropping corrupt virtual file");
                            true
                        }
                    }
                }
            }
        };

        if stale {
            if let Some((id, file)) = self.files.remove(id) {
                self.release(&id, &file, EvictionReason::Expired);
            }
        }
        None
    }

    fn record_lookup(&self, repository: &str, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(index) = self.repositories.get(repository) {
            let counter = if hit { &index.hits } else { &index.misses };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Known paths, filtered by glob and/or language, in lexicographic order
    pub fn list_files(&self, repository: &str, pattern: Option<&str>, language: Option<&str>) -> Result<Vec<String>> {
        let pattern = pattern
            .map(|p| {
                Pattern::new(p).map_err(|e| Error::Configuration(format!("invalid file pattern {}: {}", p, e)))
            })
            .transpose()?;

        let index = self
            .repositories
            .get(repository)
            .ok_or_else(|| Error::InvalidRepository(repository.to_string()))?;

        Ok(index
            .files
            .iter()
            .filter(|path| {
                pattern
                    .as_ref()
                    .map(|p| p.matches_with(path, PATH_MATCH_OPTIONS))
                    .unwrap_or(true)
            })
            .filter(|path| match language {
                Some(wanted) => detect_language(path)
                    .map(|detected| detected.eq_ignore_ascii_case(wanted))
                    .unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect())
    }

    // =========================================================================
    // Memory Enforcement
    // =========================================================================

    /// Make a new virtual file resident, evicting under the ceiling first
    fn admit(&self, id: FileId, file: VirtualFile) -> Result<()> {
        let incoming = file.resident_bytes();
        let ceiling = self.config.memory_ceiling_bytes;
        if incoming > ceiling {
            return Err(Error::CapacityExceeded {
                requested: incoming,
                ceiling,
            });
        }

        if !self.repositories.contains_key(&id.0) {
            // Repository cleaned up while the fetch was in flight
            return Ok(());
        }
        if let Some(mut existing) = self.files.get_mut(&id) {
            // A concurrent miss already made it resident
            let size = existing.size_bytes;
            existing
                .metrics
                .record_access(file.cached_at, size, false, &self.config.patterns);
            return Ok(());
        }

        if !self.reserve(incoming, ceiling) {
            let candidates = self.eviction_candidates();
            let _eviction = self.eviction.lock();
            // Another admission may have freed enough while we sorted
            if !self.reserve(incoming, ceiling) {
                self.evict_to(candidates, self.config.eviction_target_bytes());
                if !self.reserve(incoming, ceiling) {
                    return Err(Error::CapacityExceeded {
                        requested: self.resident_bytes.load(Ordering::Relaxed) + incoming,
                        ceiling,
                    });
                }
            }
        }

        match self.files.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.resident_bytes.fetch_sub(incoming, Ordering::Relaxed);
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(file);
            }
        }

        // Cleanup may have run between the repository check and the insert
        if !self.repositories.contains_key(&id.0) {
            if let Some((_, file)) = self.files.remove(&id) {
                self.resident_bytes.fetch_sub(file.resident_bytes(), Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Add `incoming` to resident bytes unless that passes `ceiling`
    fn reserve(&self, incoming: u64, ceiling: u64) -> bool {
        self.resident_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |resident| {
                (resident + incoming <= ceiling).then_some(resident + incoming)
            })
            .is_ok()
    }

    /// Resident files ordered by ascending access count, then oldest access
    fn eviction_candidates(&self) -> Vec<FileId> {
        let mut candidates: Vec<(u64, DateTime<Utc>, FileId)> = self
            .files
            .iter()
            .map(|entry| {
                (
                    entry.metrics.access_count,
                    entry.metrics.last_access,
                    entry.key().clone(),
                )
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Evict `candidates` in order until resident bytes are at most `target`
    fn evict_to(&self, candidates: Vec<FileId>, target: u64) -> usize {
        let mut evicted = 0;
        for id in candidates {
            if self.resident_bytes.load(Ordering::Relaxed) <= target {
                break;
            }
            if let Some((id, file)) = self.files.remove(&id) {
                self.release(&id, &file, EvictionReason::Capacity);
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(
                evicted,
                resident_bytes = self.resident_bytes.load(Ordering::Relaxed),
                target_bytes = target,
                "Evicted virtual files under memory pressure"
            );
        }
        evicted
    }

    fn release(&self, id: &FileId, file: &VirtualFile, reason: EvictionReason) {
        let size_bytes = file.resident_bytes();
        self.resident_bytes.fetch_sub(size_bytes, Ordering::Relaxed);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(repository = %id.0, path = %id.1, size_bytes, reason = %reason, "Evicted virtual file");
        self.events.emit(EngineEvent::FileEvicted {
            repository: id.0.clone(),
            path: id.1.clone(),
            size_bytes,
            reason,
        });
    }

    // =========================================================================
    // Prefetch
    // =========================================================================

    async fn schedule_prefetch(&self, repository: &str, path: &str) {
        if !self.prefetcher.is_enabled() {
            return;
        }

        let request = {
            let Some(index) = self.repositories.get(repository) else {
                return;
            };
            let related: Vec<String> = related_files(path, &index.files, self.config.prefetch.max_related)
                .into_iter()
                .filter(|p| !self.files.contains_key(&(repository.to_string(), p.clone())))
                .collect();
            let priority = match index.effective {
                CacheStrategy::Eager | CacheStrategy::Predictive => 2,
                CacheStrategy::Lazy | CacheStrategy::Adaptive => 1,
            };
            PrefetchRequest::new(repository, related).with_priority(priority)
        };

        if !request.paths.is_empty() {
            debug!(repository = %repository, path = %path, related = request.paths.len(), "Scheduling prefetch");
            self.prefetcher.submit(request).await;
        }
    }

    /// Warm one batch of queued files into the tiered store.
    ///
    /// Returns the number of files taken from the queue. Failures only show
    /// up in the prefetch statistics.
    pub async fn drain_prefetch(&self) -> usize {
        let batch = self.prefetcher.next_batch(self.config.prefetch.batch_size).await;
        let taken = batch.len();

        stream::iter(batch)
            .for_each_concurrent(self.config.prefetch.max_concurrent.max(1), |item| async move {
                self.prefetch_one(&item.repository, &item.path).await;
            })
            .await;

        taken
    }

    fn knows_file(&self, repository: &str, path: &str) -> bool {
        self.repositories
            .get(repository)
            .map(|index| index.files.contains(path))
            .unwrap_or(false)
    }

    async fn prefetch_one(&self, repository: &str, path: &str) {
        if !self.knows_file(repository, path) {
            return;
        }

        let key = CacheKey::file(repository, path);
        if let Some(Some(_)) = self.store.get(key.as_str()).await.best_effort("prefetch lookup") {
            self.prefetcher.record_cached();
            return;
        }

        let Some(text) = self
            .source
            .fetch(repository, path)
            .await
            .best_effort("prefetch fetch")
            .flatten()
        else {
            self.prefetcher.record_failed();
            return;
        };
        if !self.knows_file(repository, path) {
            debug!(repository = %repository, path = %path, "Repository cleaned up during prefetch");
            return;
        }

        let size_bytes = text.len() as u64;
        let stored = self
            .store
            .set(key.as_str(), text, Some(self.config.file_ttl_secs))
            .await
            .best_effort("prefetch store");
        if stored.is_some() && !self.knows_file(repository, path) {
            // Cleanup ran while the write was in flight
            self.store.delete(key.as_str()).await.best_effort("drop orphaned prefetch");
            return;
        }
        if stored.is_some() {
            self.prefetcher.record_loaded(size_bytes);
            self.events.emit(EngineEvent::Prefetched {
                repository: repository.to_string(),
                path: path.to_string(),
                size_bytes,
            });
        } else {
            self.prefetcher.record_failed();
        }
    }

    // =========================================================================
    // Periodic Optimization
    // =========================================================================

    /// Drop expired files, trim overflow and re-evaluate adaptive repositories
    #[instrument(skip(self))]
    pub fn optimize(&self) -> OptimizationSummary {
        let now = self.clock.now();
        let mut summary = OptimizationSummary::default();

        let expired: Vec<FileId> = self
            .files
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for id in expired {
            if let Some((id, file)) = self.files.remove_if(&id, |_, file| file.is_expired(now)) {
                self.release(&id, &file, EvictionReason::Expired);
                summary.expired_removed += 1;
            }
        }

        let resident = self.files.len();
        if resident > self.config.max_resident_files {
            let count = ((resident as f64) * self.config.overflow_evict_fraction).ceil() as usize;
            let mut by_age: Vec<(FileId, DateTime<Utc>)> = self
                .files
                .iter()
                .map(|entry| (entry.key().clone(), entry.metrics.last_access))
                .collect();
            by_age.sort_by(|a, b| a.1.cmp(&b.1));

            for (id, _) in by_age.into_iter().take(count) {
                if let Some((id, file)) = self.files.remove(&id) {
                    self.release(&id, &file, EvictionReason::Overflow);
                    summary.overflow_evicted += 1;
                }
            }
        }

        summary.strategy_changes = self.reevaluate_adaptive();

        if summary != OptimizationSummary::default() {
            info!(
                expired_removed = summary.expired_removed,
                overflow_evicted = summary.overflow_evicted,
                strategy_changes = summary.strategy_changes,
                "Optimization pass complete"
            );
        }
        summary
    }

    fn reevaluate_adaptive(&self) -> usize {
        let mut totals: HashMap<String, (u64, u64)> = HashMap::new();
        for entry in self.files.iter() {
            let slot = totals.entry(entry.key().0.clone()).or_default();
            slot.0 += entry.metrics.access_count;
            slot.1 += 1;
        }

        let mut changes = 0;
        for mut index in self.repositories.iter_mut() {
            if index.strategy != CacheStrategy::Adaptive {
                continue;
            }
            let avg = match totals.get(index.key()) {
                Some((accesses, files)) if *files > 0 => *accesses as f64 / *files as f64,
                _ => 0.0,
            };
            let next = select_adaptive(avg, &self.config.adaptive);
            if next != index.effective {
                let from = index.effective;
                index.effective = next;
                info!(repository = %index.key(), from = %from, to = %next, avg_access_count = avg, "Adaptive strategy changed");
                self.events.emit(EngineEvent::StrategyChanged {
                    repository: index.key().clone(),
                    from: from.to_string(),
                    to: next.to_string(),
                });
                changes += 1;
            }
        }
        changes
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Drop every trace of a repository. Calling it again is a no-op.
    pub async fn cleanup_repository(&self, repository: &str) -> RepositoryCleanup {
        let mut cleanup = RepositoryCleanup {
            repository: repository.to_string(),
            ..Default::default()
        };

        {
            cleanup.was_initialized = self.repositories.remove(repository).is_some();
            self.files.retain(|(repo, _), file| {
                if repo == repository {
                    cleanup.files_removed += 1;
                    cleanup.bytes_released += file.resident_bytes();
                    false
                } else {
                    true
                }
            });
            self.resident_bytes
                .fetch_sub(cleanup.bytes_released, Ordering::Relaxed);
        }
        cleanup.prefetch_dropped = self.prefetcher.remove_repository(repository).await;

        if cleanup.was_initialized || cleanup.files_removed > 0 {
            info!(
                repository = %repository,
                files_removed = cleanup.files_removed,
                bytes_released = cleanup.bytes_released,
                prefetch_dropped = cleanup.prefetch_dropped,
                "Repository cleaned up"
            );
            self.events.emit(EngineEvent::RepositoryCleaned {
                repository: repository.to_string(),
                files_removed: cleanup.files_removed,
            });
        }
        cleanup
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn is_initialized(&self, repository: &str) -> bool {
        self.repositories.contains_key(repository)
    }

    /// Strategy currently applied to a repository
    pub fn strategy(&self, repository: &str) -> Option<CacheStrategy> {
        self.repositories.get(repository).map(|index| index.effective)
    }

    pub fn is_resident(&self, repository: &str, path: &str) -> bool {
        self.files
            .contains_key(&(repository.to_string(), path.to_string()))
    }

    /// Access metrics of a resident file
    pub fn file_metrics(&self, repository: &str, path: &str) -> Option<AccessMetrics> {
        self.files
            .get(&(repository.to_string(), path.to_string()))
            .map(|file| file.metrics.clone())
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }

    pub fn resident_files(&self) -> usize {
        self.files.len()
    }

    pub fn prefetcher(&self) -> &Prefetcher {
        &self.prefetcher
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Status of one repository
    pub async fn repository_status(&self, repository: &str) -> Option<RepositoryStatus> {
        let mut status = {
            let index = self.repositories.get(repository)?;
            let hits = index.hits.load(Ordering::Relaxed);
            let misses = index.misses.load(Ordering::Relaxed);
            RepositoryStatus {
                repository: repository.to_string(),
                strategy: index.strategy,
                effective_strategy: index.effective,
                initialized_at: index.initialized_at,
                known_files: index.files.len(),
                resident_files: 0,
                resident_bytes: 0,
                hits,
                misses,
                hit_ratio: ratio(hits, misses),
                pending_prefetch: 0,
            }
        };

        for entry in self.files.iter().filter(|entry| entry.key().0 == repository) {
            status.resident_files += 1;
            status.resident_bytes += entry.resident_bytes();
        }
        status.pending_prefetch = self.prefetcher.pending_files(Some(repository)).await;
        Some(status)
    }

    /// Aggregate status across repositories
    pub async fn status(&self) -> OptimizerStatus {
        let mut names: Vec<String> = self.repositories.iter().map(|index| index.key().clone()).collect();
        names.sort();

        let mut repositories = Vec::with_capacity(names.len());
        for name in names {
            if let Some(status) = self.repository_status(&name).await {
                repositories.push(status);
            }
        }

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        OptimizerStatus {
            repositories,
            resident_files: self.files.len(),
            resident_bytes: self.resident_bytes(),
            memory_ceiling_bytes: self.config.memory_ceiling_bytes,
            hits,
            misses,
            hit_ratio: ratio(hits, misses),
            evictions: self.evictions.load(Ordering::Relaxed),
            pending_prefetch: self.prefetcher.pending_files(None).await,
            prefetch: self.prefetcher.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use crate::clock::ManualClock;
    use crate::optimizer::source::StaticSource;
    use crate::store::remote::InMemoryRemoteStore;
    use crate::store::StoreConfig;
    use tokio::sync::Notify;

    const REPO: &str = "acme/widgets";

    struct Fixture {
        optimizer: AccessOptimizer,
        source: Arc<StaticSource>,
        remote: Arc<InMemoryRemoteStore>,
        store: Arc<TieredStore>,
        clock: Arc<ManualClock>,
        events: EventBus,
    }

    fn fixture(config: OptimizerConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let events = EventBus::new(256);
        let remote = Arc::new(InMemoryRemoteStore::new(clock.clone()));
        let store = Arc::new(TieredStore::new(
            StoreConfig::default(),
            remote.clone(),
            clock.clone(),
            events.clone(),
        ));
        let source = Arc::new(StaticSource::new());
        let optimizer = AccessOptimizer::new(config, store.clone(), source.clone(), clock.clone(), events.clone());
        Fixture {
            optimizer,
            source,
            remote,
            store,
            clock,
            events,
        }
    }

    fn seed(source: &StaticSource, repo: &str, files: &[(&str, &str)]) -> Vec<RepoFile> {
        files
            .iter()
            .map(|(path, content)| {
                source.insert(repo, path, *content);
                RepoFile::new(*path, Some(content.len() as u64))
            })
            .collect()
    }

    fn widgets(source: &StaticSource) -> Vec<RepoFile> {
        seed(
            source,
            REPO,
            &[
                ("README.md", "# widgets"),
                ("src/lib.rs", "pub mod widget;"),
                ("src/widget.rs", "pub struct Widget;"),
            ],
        )
    }

    #[tokio::test]
    async fn test_uninitialized_repository_is_rejected() {
        let f = fixture(OptimizerConfig::default());
        assert_matches!(
            f.optimizer.get_file_content("nobody/nothing", "README.md").await,
            Err(Error::InvalidRepository(_))
        );
        assert_matches!(
            f.optimizer.list_files("nobody/nothing", None, None),
            Err(Error::InvalidRepository(_))
        );
    }

    #[tokio::test]
    async fn test_lazy_initialization_preloads_readme() {
        let f = fixture(OptimizerConfig::default());
        let files = widgets(&f.source);

        let report = f
            .optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        assert_eq!(report.known_files, 3);
        assert_eq!(report.selected, vec!["README.md"]);
        assert_eq!(report.preloaded, 1);
        assert!(f.remote.raw("repo:acme/widgets:file:README.md").is_some());
        assert!(f.remote.raw("repo:acme/widgets:file:src/lib.rs").is_none());
        assert_eq!(f.optimizer.strategy(REPO), Some(CacheStrategy::Lazy));
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let f = fixture(OptimizerConfig::default());
        let files = widgets(&f.source);
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        let first = f.optimizer.get_file_content(REPO, "src/lib.rs").await.unwrap().unwrap();
        assert_eq!(first.content, "pub mod widget;");
        assert_eq!(first.language.as_deref(), Some("rust"));
        assert!(!first.from_memory);

        f.clock.advance(secs(5));
        let second = f.optimizer.get_file_content(REPO, "src/lib.rs").await.unwrap().unwrap();
        assert!(second.from_memory);
        assert_eq!(second.content, first.content);

        let metrics = f.optimizer.file_metrics(REPO, "src/lib.rs").unwrap();
        assert_eq!(metrics.access_count, 2);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);

        // README preload plus one fetch for src/lib.rs
        assert_eq!(f.source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_missing_paths_are_not_found() {
        let f = fixture(OptimizerConfig::default());
        let mut files = widgets(&f.source);
        files.push(RepoFile::new("src/gone.rs", Some(10)));
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        assert_eq!(f.optimizer.get_file_content(REPO, "src/other.rs").await.unwrap(), None);
        assert_eq!(f.optimizer.get_file_content(REPO, "src/gone.rs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_source_failure_is_not_found() {
        let f = fixture(OptimizerConfig::default());
        let files = widgets(&f.source);
        f.source.fail_path(REPO, "src/widget.rs");
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        assert_eq!(f.optimizer.get_file_content(REPO, "src/widget.rs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_outage_falls_back_to_source() {
        let f = fixture(OptimizerConfig::default());
        let files = widgets(&f.source);
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        f.remote.set_available(false);
        let content = f.optimizer.get_file_content(REPO, "src/widget.rs").await.unwrap().unwrap();
        assert_eq!(content.content, "pub struct Widget;");
    }

    #[tokio::test]
    async fn test_initialization_skips_failed_files() {
        let f = fixture(OptimizerConfig::default());
        let files = seed(
            &f.source,
            REPO,
            &[("a.rs", "a"), ("b.rs", "b"), ("c.rs", "c")],
        );
        f.source.fail_path(REPO, "b.rs");

        let report = f
            .optimizer
            .initialize_repository(REPO, files, CacheStrategy::Eager)
            .await
            .unwrap();
        assert_eq!(report.selected.len(), 3);
        assert_eq!(report.preloaded, 2);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_list_files_filters() {
        let f = fixture(OptimizerConfig::default());
        let files = seed(
            &f.source,
            REPO,
            &[
                ("src/main.rs", ""),
                ("src/util.py", ""),
                ("README.md", ""),
                ("src/nested/deep.rs", ""),
            ],
        );
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        assert_eq!(
            f.optimizer.list_files(REPO, None, None).unwrap(),
            vec!["README.md", "src/main.rs", "src/nested/deep.rs", "src/util.py"]
        );
        assert_eq!(
            f.optimizer.list_files(REPO, Some("src/*"), None).unwrap(),
            vec!["src/main.rs", "src/util.py"]
        );
        assert_eq!(
            f.optimizer.list_files(REPO, Some("src/**/*.rs"), Some("rust")).unwrap(),
            vec!["src/main.rs", "src/nested/deep.rs"]
        );
        assert_eq!(
            f.optimizer.list_files(REPO, None, Some("Python")).unwrap(),
            vec!["src/util.py"]
        );
        assert!(f.optimizer.list_files(REPO, Some("[unclosed"), None).is_err());
    }

    #[tokio::test]
    async fn test_eviction_keeps_usage_under_ceiling() {
        let config = OptimizerConfig {
            memory_ceiling_bytes: 1000,
            ..Default::default()
        };
        let f = fixture(config);
        let contents: Vec<(String, String)> = (0..10)
            .map(|i| (format!("f{}.txt", i), "x".repeat(150)))
            .collect();
        let pairs: Vec<(&str, &str)> = contents.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        let files = seed(&f.source, REPO, &pairs);
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        // Make f0 popular so it survives eviction
        f.optimizer.get_file_content(REPO, "f0.txt").await.unwrap();
        f.optimizer.get_file_content(REPO, "f0.txt").await.unwrap();

        for (path, _) in &contents {
            f.clock.advance(secs(1));
            f.optimizer.get_file_content(REPO, path).await.unwrap().unwrap();
            assert!(f.optimizer.resident_bytes() <= 1000);
        }

        assert!(f.optimizer.is_resident(REPO, "f0.txt"));
        assert!(f.optimizer.is_resident(REPO, "f9.txt"));
        assert!(!f.optimizer.is_resident(REPO, "f1.txt"));
        assert!(f.optimizer.status().await.evictions > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_across_repositories() {
        let config = OptimizerConfig {
            memory_ceiling_bytes: 1000,
            ..Default::default()
        };
        let f = fixture(config);
        let contents: Vec<(String, String)> = (0..12)
            .map(|i| (format!("f{}.txt", i), "x".repeat(150)))
            .collect();
        let pairs: Vec<(&str, &str)> = contents.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        for repo in [REPO, "acme/gadgets"] {
            let files = seed(&f.source, repo, &pairs);
            f.optimizer
                .initialize_repository(repo, files, CacheStrategy::Lazy)
                .await
                .unwrap();
        }

        let reads = [REPO, "acme/gadgets"]
            .into_iter()
            .flat_map(|repo| contents.iter().map(move |(path, _)| (repo, path.as_str())))
            .map(|(repo, path)| f.optimizer.get_file_content(repo, path));
        let results = futures::future::join_all(reads).await;
        assert!(results.iter().all(|r| matches!(r, Ok(Some(_)))));

        let status = f.optimizer.status().await;
        let accounted: u64 = status.repositories.iter().map(|r| r.resident_bytes).sum();
        assert!(f.optimizer.resident_bytes() <= 1000);
        assert_eq!(f.optimizer.resident_bytes(), accounted);
    }

    #[tokio::test]
    async fn test_file_larger_than_ceiling_is_served_not_kept() {
        let config = OptimizerConfig {
            memory_ceiling_bytes: 100,
            ..Default::default()
        };
        let f = fixture(config);
        let big = "y".repeat(500);
        let files = seed(&f.source, REPO, &[("big.txt", big.as_str())]);
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        let content = f.optimizer.get_file_content(REPO, "big.txt").await.unwrap().unwrap();
        assert_eq!(content.size_bytes, 500);
        assert!(!f.optimizer.is_resident(REPO, "big.txt"));
        assert_eq!(f.optimizer.resident_bytes(), 0);
    }

    #[tokio::test]
    async fn test_optimize_removes_expired_files() {
        let config = OptimizerConfig {
            file_ttl_secs: 60,
            ..Default::default()
        };
        let f = fixture(config);
        let files = widgets(&f.source);
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();
        f.optimizer.get_file_content(REPO, "src/lib.rs").await.unwrap();

        f.clock.advance(secs(61));
        let summary = f.optimizer.optimize();
        assert_eq!(summary.expired_removed, 1);
        assert!(!f.optimizer.is_resident(REPO, "src/lib.rs"));
        assert_eq!(f.optimizer.resident_bytes(), 0);
    }

    #[tokio::test]
    async fn test_optimize_trims_overflow_oldest_first() {
        let config = OptimizerConfig {
            max_resident_files: 4,
            ..Default::default()
        };
        let f = fixture(config);
        let contents: Vec<(String, String)> = (0..5).map(|i| (format!("f{}.txt", i), format!("{}", i))).collect();
        let pairs: Vec<(&str, &str)> = contents.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        let files = seed(&f.source, REPO, &pairs);
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        for (path, _) in &contents {
            f.clock.advance(secs(1));
            f.optimizer.get_file_content(REPO, path).await.unwrap();
        }

        let summary = f.optimizer.optimize();
        assert_eq!(summary.overflow_evicted, 1);
        assert!(!f.optimizer.is_resident(REPO, "f0.txt"));
        assert_eq!(f.optimizer.resident_files(), 4);
    }

    #[tokio::test]
    async fn test_adaptive_reevaluation() {
        let f = fixture(OptimizerConfig::default());
        let mut rx = f.events.subscribe();
        let files = widgets(&f.source);
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Adaptive)
            .await
            .unwrap();
        assert_eq!(f.optimizer.strategy(REPO), Some(CacheStrategy::Predictive));

        // One access on average: falls back to lazy
        f.optimizer.get_file_content(REPO, "README.md").await.unwrap();
        assert_eq!(f.optimizer.optimize().strategy_changes, 1);
        assert_eq!(f.optimizer.strategy(REPO), Some(CacheStrategy::Lazy));

        for _ in 0..11 {
            f.optimizer.get_file_content(REPO, "README.md").await.unwrap();
        }
        f.optimizer.optimize();
        assert_eq!(f.optimizer.strategy(REPO), Some(CacheStrategy::Eager));

        let mut changes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::StrategyChanged { from, to, .. } = event {
                changes.push((from, to));
            }
        }
        assert_eq!(
            changes,
            vec![
                ("predictive".to_string(), "lazy".to_string()),
                ("lazy".to_string(), "eager".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_miss_schedules_related_prefetch() {
        let f = fixture(OptimizerConfig::default());
        let files = seed(
            &f.source,
            REPO,
            &[
                ("src/widget.py", "class Widget: pass"),
                ("tests/test_widget.py", "def test_widget(): pass"),
                ("docs/guide.md", "guide"),
            ],
        );
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        f.optimizer.get_file_content(REPO, "src/widget.py").await.unwrap();
        assert_eq!(f.optimizer.prefetcher().pending_files(Some(REPO)).await, 1);

        assert_eq!(f.optimizer.drain_prefetch().await, 1);
        assert!(f.remote.raw("repo:acme/widgets:file:tests/test_widget.py").is_some());
        assert_eq!(f.optimizer.prefetcher().stats().files_loaded, 1);

        // Prefetch warms the store only
        assert!(!f.optimizer.is_resident(REPO, "tests/test_widget.py"));
    }

    /// Blocks fetches of one path until released
    struct GatedSource {
        inner: StaticSource,
        gated: String,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ContentSource for GatedSource {
        async fn fetch(&self, repository: &str, path: &str) -> Result<Option<String>> {
            if path == self.gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.fetch(repository, path).await
        }
    }

    #[tokio::test]
    async fn test_cleanup_during_prefetch_leaves_no_keys() {
        let clock = Arc::new(ManualClock::new());
        let events = EventBus::new(256);
        let remote = Arc::new(InMemoryRemoteStore::new(clock.clone()));
        let store = Arc::new(TieredStore::new(
            StoreConfig::default(),
            remote.clone(),
            clock.clone(),
            events.clone(),
        ));
        let source = Arc::new(GatedSource {
            inner: StaticSource::new(),
            gated: "tests/test_widget.py".to_string(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let files = seed(
            &source.inner,
            REPO,
            &[
                ("src/widget.py", "class Widget: pass"),
                ("tests/test_widget.py", "def test_widget(): pass"),
            ],
        );
        let optimizer = AccessOptimizer::new(OptimizerConfig::default(), store, source.clone(), clock, events);
        optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();
        optimizer.get_file_content(REPO, "src/widget.py").await.unwrap();

        let teardown = async {
            source.entered.notified().await;
            optimizer.cleanup_repository(REPO).await;
            source.release.notify_one();
        };
        let (taken, _) = tokio::join!(optimizer.drain_prefetch(), teardown);

        assert_eq!(taken, 1);
        assert!(remote.raw("repo:acme/widgets:file:tests/test_widget.py").is_none());
        assert_eq!(optimizer.prefetcher().stats().files_loaded, 0);
    }

    #[tokio::test]
    async fn test_prefetch_failures_are_silent() {
        let f = fixture(OptimizerConfig::default());
        let files = seed(
            &f.source,
            REPO,
            &[("src/a.rs", "a"), ("src/b.rs", "b")],
        );
        f.source.fail_path(REPO, "src/b.rs");
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();

        f.optimizer.get_file_content(REPO, "src/a.rs").await.unwrap().unwrap();
        assert_eq!(f.optimizer.drain_prefetch().await, 1);
        assert_eq!(f.optimizer.prefetcher().stats().files_failed, 1);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let f = fixture(OptimizerConfig::default());
        let files = widgets(&f.source);
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Lazy)
            .await
            .unwrap();
        f.optimizer.get_file_content(REPO, "src/widget.rs").await.unwrap();

        let first = f.optimizer.cleanup_repository(REPO).await;
        assert!(first.was_initialized);
        assert_eq!(first.files_removed, 1);
        assert_eq!(first.prefetch_dropped, 1);

        let second = f.optimizer.cleanup_repository(REPO).await;
        assert!(!second.was_initialized);
        assert_eq!(second.files_removed, 0);

        assert!(!f.optimizer.is_initialized(REPO));
        assert_eq!(f.optimizer.resident_bytes(), 0);
        assert_eq!(f.optimizer.prefetcher().pending_files(None).await, 0);
        assert!(f.optimizer.status().await.repositories.is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_per_repository() {
        let f = fixture(OptimizerConfig::default());
        let files = widgets(&f.source);
        f.optimizer
            .initialize_repository(REPO, files, CacheStrategy::Predictive)
            .await
            .unwrap();
        let other = seed(&f.source, "acme/gadgets", &[("README.md", "# gadgets")]);
        f.optimizer
            .initialize_repository("acme/gadgets", other, CacheStrategy::Eager)
            .await
            .unwrap();

        f.optimizer.get_file_content(REPO, "README.md").await.unwrap();
        f.optimizer.get_file_content(REPO, "README.md").await.unwrap();

        let status = f.optimizer.status().await;
        assert_eq!(status.repositories.len(), 2);
        assert_eq!(status.repositories[0].repository, "acme/gadgets");

        let acme = &status.repositories[1];
        assert_eq!(acme.known_files, 3);
        assert_eq!(acme.resident_files, 1);
        assert_eq!(acme.hits, 1);
        assert_eq!(acme.misses, 1);
        assert!((acme.hit_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(status.hits, 1);
        assert_eq!(f.store.status().metrics.sets, 4);
    }
}
