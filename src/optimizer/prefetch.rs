//! Async Prefetcher
//!
//! Queues related files for background warming after a cache miss. Requests
//! are ordered by priority; the drainer task pulls batches and loads them
//! into the tiered store. Prefetching is best-effort throughout.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

// =============================================================================
// Prefetch Configuration
// =============================================================================

/// Configuration for the prefetcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Whether prefetching is enabled
    pub enabled: bool,
    /// Related files queued per miss
    pub max_related: usize,
    /// Maximum queued requests
    pub max_queue_size: usize,
    /// Files drained per tick
    pub batch_size: usize,
    /// Concurrent loads while draining
    pub max_concurrent: usize,
    /// Drainer tick, in milliseconds
    pub drain_interval_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_related: 5,
            max_queue_size: 1000,
            batch_size: 16,
            max_concurrent: 4,
            drain_interval_ms: 500,
        }
    }
}

// =============================================================================
// Prefetch Request
// =============================================================================

/// A request to prefetch files of one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchRequest {
    pub repository: String,
    pub paths: Vec<String>,
    /// Priority (higher = more urgent)
    pub priority: u8,
}

impl PrefetchRequest {
    pub fn new(repository: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            repository: repository.into(),
            paths,
            priority: 0,
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// One file handed to the drainer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchItem {
    pub repository: String,
    pub path: String,
}

// =============================================================================
// Prefetch Stats
// =============================================================================

/// Statistics for prefetch operations
#[derive(Debug, Default)]
pub struct PrefetchStats {
    pub requests: AtomicU64,
    pub files_requested: AtomicU64,
    /// Files fetched from the source and stored
    pub files_loaded: AtomicU64,
    /// Files already present in the tiered store
    pub files_cached: AtomicU64,
    pub files_failed: AtomicU64,
    /// Requests dropped when the queue was full
    pub requests_dropped: AtomicU64,
    pub bytes_loaded: AtomicU64,
}

impl PrefetchStats {
    pub fn snapshot(&self) -> PrefetchStatsSnapshot {
        PrefetchStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            files_requested: self.files_requested.load(Ordering::Relaxed),
            files_loaded: self.files_loaded.load(Ordering::Relaxed),
            files_cached: self.files_cached.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            bytes_loaded: self.bytes_loaded.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of prefetch statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefetchStatsSnapshot {
    pub requests: u64,
    pub files_requested: u64,
    pub files_loaded: u64,
    pub files_cached: u64,
    pub files_failed: u64,
    pub requests_dropped: u64,
    pub bytes_loaded: u64,
}

impl PrefetchStatsSnapshot {
    /// Fraction of requested files that were loaded
    pub fn success_ratio(&self) -> f64 {
        if self.files_requested == 0 {
            0.0
        } else {
            self.files_loaded as f64 / self.files_requested as f64
        }
    }
}

// =============================================================================
// Related-File Discovery
// =============================================================================

const TEST_MARKERS: [&str; 6] = ["test_", "_test", "_spec", ".test", ".spec", "Test"];

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    }
}

/// File stem with test markers removed: `test_widget.py`, `widget_test.go`,
/// `widget.spec.ts` and `widget.rs` all reduce to `widget`
fn base_stem(name: &str) -> String {
    let mut stem = match name.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => name.to_string(),
    };
    for marker in TEST_MARKERS {
        if let Some(rest) = stem.strip_prefix(marker) {
            stem = rest.to_string();
        }
        if let Some(rest) = stem.strip_suffix(marker) {
            stem = rest.to_string();
        }
    }
    stem
}

/// Files likely to be read next after `path`.
///
/// Name-similar files (test counterparts) come first, then siblings in the
/// same directory, capped at `max`.
pub fn related_files(path: &str, known: &BTreeSet<String>, max: usize) -> Vec<String> {
    let (dir, name) = split_path(path);
    let stem = base_stem(name);

    let mut related: Vec<String> = Vec::new();
    if !stem.is_empty() {
        related.extend(
            known
                .iter()
                .filter(|candidate| candidate.as_str() != path)
                .filter(|candidate| base_stem(split_path(candidate).1) == stem)
                .take(max)
                .cloned(),
        );
    }

    for candidate in known {
        if related.len() >= max {
            break;
        }
        if candidate == path || related.contains(candidate) {
            continue;
        }
        if split_path(candidate).0 == dir {
            related.push(candidate.clone());
        }
    }

    related.truncate(max);
    related
}

// =============================================================================
// Prefetcher
// =============================================================================

/// Priority queue of prefetch work
pub struct Prefetcher {
    config: PrefetchConfig,
    queue: Mutex<VecDeque<PrefetchRequest>>,
    stats: PrefetchStats,
}

impl Prefetcher {
    pub fn new() -> Self {
        Self::with_config(PrefetchConfig::default())
    }

    pub fn with_config(config: PrefetchConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            stats: PrefetchStats::default(),
        }
    }

    /// Queue a request; the lowest-priority request is dropped when full
    pub async fn submit(&self, request: PrefetchRequest) {
        if !self.config.enabled || request.paths.is_empty() {
            return;
        }

        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats
            .files_requested
            .fetch_add(request.paths.len() as u64, Ordering::Relaxed);

        let mut queue = self.queue.lock().await;

        // Insert based on priority (higher priority = closer to front)
        let pos = queue
            .iter()
            .position(|r| r.priority < request.priority)
            .unwrap_or(queue.len());
        queue.insert(pos, request);

        while queue.len() > self.config.max_queue_size.max(1) {
            queue.pop_back();
            self.stats.requests_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take up to `max_files` files from the front of the queue
    pub async fn next_batch(&self, max_files: usize) -> Vec<PrefetchItem> {
        let mut queue = self.queue.lock().await;
        let mut items = Vec::new();

        while items.len() < max_files {
            let Some(mut request) = queue.pop_front() else {
                break;
            };
            let room = max_files - items.len();
            if request.paths.len() > room {
                // Put the remainder back at the front
                let rest = request.paths.split_off(room);
                queue.push_front(PrefetchRequest {
                    repository: request.repository.clone(),
                    paths: rest,
                    priority: request.priority,
                });
            }
            items.extend(request.paths.into_iter().map(|path| PrefetchItem {
                repository: request.repository.clone(),
                path,
            }));
        }

        items
    }

    /// Drop every pending request for a repository
    pub async fn remove_repository(&self, repository: &str) -> usize {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|r| r.repository != repository);
        before - queue.len()
    }

    /// Pending files, optionally for one repository
    pub async fn pending_files(&self, repository: Option<&str>) -> usize {
        self.queue
            .lock()
            .await
            .iter()
            .filter(|r| repository.map(|repo| r.repository == repo).unwrap_or(true))
            .map(|r| r.paths.len())
            .sum()
    }

    pub fn record_loaded(&self, bytes: u64) {
        self.stats.files_loaded.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_loaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_cached(&self) {
        self.stats.files_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.stats.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PrefetchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn clear(&self) {
        self.queue.lock().await.clear();
    }
}

impl Default for Prefetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_related_prefers_test_counterparts() {
        let files = known(&[
            "src/widget.py",
            "src/gadget.py",
            "src/util.py",
            "tests/test_widget.py",
            "docs/index.md",
        ]);

        let related = related_files("src/widget.py", &files, 5);
        assert_eq!(related[0], "tests/test_widget.py");
        assert!(related.contains(&"src/gadget.py".to_string()));
        assert!(related.contains(&"src/util.py".to_string()));
        assert!(!related.contains(&"docs/index.md".to_string()));
        assert!(!related.contains(&"src/widget.py".to_string()));
    }

    #[test]
    fn test_related_from_test_to_source() {
        let files = known(&["lib/parser.ts", "lib/parser.spec.ts", "lib/lexer.ts"]);
        let related = related_files("lib/parser.spec.ts", &files, 1);
        assert_eq!(related, vec!["lib/parser.ts"]);
    }

    #[test]
    fn test_related_is_capped() {
        let files: BTreeSet<String> = (0..20).map(|i| format!("src/f{}.rs", i)).collect();
        assert_eq!(related_files("src/f0.rs", &files, 3).len(), 3);
    }

    #[tokio::test]
    async fn test_submit_and_retrieve() {
        let prefetcher = Prefetcher::new();
        prefetcher
            .submit(PrefetchRequest::new(
                "acme/widgets",
                vec!["a.rs".into(), "b.rs".into()],
            ))
            .await;

        assert_eq!(prefetcher.pending_files(None).await, 2);
        let batch = prefetcher.next_batch(10).await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].path, "a.rs");
        assert_eq!(prefetcher.pending_files(None).await, 0);
    }

    #[tokio::test]
    async fn test_priority_ordering_and_partial_batches() {
        let prefetcher = Prefetcher::new();
        prefetcher
            .submit(PrefetchRequest::new("r", vec!["low".into()]).with_priority(0))
            .await;
        prefetcher
            .submit(PrefetchRequest::new("r", vec!["high1".into(), "high2".into()]).with_priority(200))
            .await;

        let batch = prefetcher.next_batch(1).await;
        assert_eq!(batch[0].path, "high1");
        let batch = prefetcher.next_batch(1).await;
        assert_eq!(batch[0].path, "high2");
        let batch = prefetcher.next_batch(1).await;
        assert_eq!(batch[0].path, "low");
    }

    #[tokio::test]
    async fn test_queue_limit_drops_lowest_priority() {
        let prefetcher = Prefetcher::with_config(PrefetchConfig {
            max_queue_size: 2,
            ..Default::default()
        });

        prefetcher
            .submit(PrefetchRequest::new("r", vec!["keep".into()]).with_priority(9))
            .await;
        prefetcher
            .submit(PrefetchRequest::new("r", vec!["also".into()]).with_priority(5))
            .await;
        prefetcher
            .submit(PrefetchRequest::new("r", vec!["dropped".into()]).with_priority(1))
            .await;

        let batch = prefetcher.next_batch(10).await;
        let paths: Vec<_> = batch.into_iter().map(|i| i.path).collect();
        assert_eq!(paths, vec!["keep", "also"]);
        assert_eq!(prefetcher.stats().requests_dropped, 1);
    }

    #[tokio::test]
    async fn test_remove_repository() {
        let prefetcher = Prefetcher::new();
        prefetcher
            .submit(PrefetchRequest::new("acme/widgets", vec!["a".into()]))
            .await;
        prefetcher
            .submit(PrefetchRequest::new("acme/gadgets", vec!["b".into()]))
            .await;

        assert_eq!(prefetcher.remove_repository("acme/widgets").await, 1);
        assert_eq!(prefetcher.pending_files(Some("acme/widgets")).await, 0);
        assert_eq!(prefetcher.pending_files(Some("acme/gadgets")).await, 1);
    }

    #[tokio::test]
    async fn test_disabled_prefetcher_ignores_requests() {
        let prefetcher = Prefetcher::with_config(PrefetchConfig {
            enabled: false,
            ..Default::default()
        });
        prefetcher
            .submit(PrefetchRequest::new("r", vec!["a".into()]))
            .await;
        assert_eq!(prefetcher.pending_files(None).await, 0);
        assert_eq!(prefetcher.stats().requests, 0);
    }
}
