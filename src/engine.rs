//! Cache Engine
//!
//! Explicitly constructed composition root holding the tiered store, the
//! access-pattern optimizer and the lifecycle coordinator. Background loops
//! (sweep, health monitor, optimization pass, prefetch drainer) run on a
//! task tracker and stop together on [`CacheEngine::shutdown`].

use crate::clock::ClockRef;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::lifecycle::{
    CleanupSummary, LifecycleCoordinator, LifecycleStatus, NavigationEvent, NavigationOutcome, SweepReport,
};
use crate::optimizer::{
    AccessOptimizer, CacheStrategy, ContentSource, FileContent, InitializeReport, OptimizerStatus, RepoFile,
    RepositoryCleanup,
};
use crate::store::entry::CacheKey;
use crate::store::remote::RemoteStore;
use crate::store::{HealthReport, StoreStatus, TieredStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Store facet holding a repository's known file list
const INDEX_FACET: &str = "index";

// =============================================================================
// Requests and Status
// =============================================================================

/// A user opening a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRepository {
    pub user_id: String,
    pub repository: String,
    pub files: Vec<RepoFile>,
    pub strategy: CacheStrategy,
    /// Navigation path the repository was opened from
    pub navigation_context: String,
    /// Lifetime of the repository's lifecycle entry
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Result of [`CacheEngine::open_repository`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenedRepository {
    /// Lifecycle key tracking the repository for this user
    pub key: String,
    pub report: InitializeReport,
}

/// Everything the introspection surface exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
    pub store: StoreStatus,
    pub optimizer: OptimizerStatus,
    pub lifecycle: LifecycleStatus,
}

// =============================================================================
// Cache Engine
// =============================================================================

pub struct CacheEngine {
    config: EngineConfig,
    store: Arc<TieredStore>,
    optimizer: Arc<AccessOptimizer>,
    lifecycle: Arc<LifecycleCoordinator>,
    events: EventBus,
    /// Replaced on every start so the engine can be restarted
    cancel: Mutex<CancellationToken>,
    tasks: TaskTracker,
    running: AtomicBool,
}

impl CacheEngine {
    /// Wire the components over a remote store and content source
    pub fn new(
        config: EngineConfig,
        remote: Arc<dyn RemoteStore>,
        source: Arc<dyn ContentSource>,
        clock: ClockRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let store = Arc::new(TieredStore::new(
            config.store.clone(),
            remote,
            clock.clone(),
            events.clone(),
        ));
        let optimizer = Arc::new(AccessOptimizer::new(
            config.optimizer.clone(),
            store.clone(),
            source,
            clock.clone(),
            events.clone(),
        ));
        let lifecycle = Arc::new(LifecycleCoordinator::new(
            config.lifecycle.clone(),
            store.clone(),
            optimizer.clone(),
            clock,
            events.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            store,
            optimizer,
            lifecycle,
            events,
            cancel: Mutex::new(CancellationToken::new()),
            tasks: TaskTracker::new(),
            running: AtomicBool::new(false),
        }))
    }

    /// Connect to the remote store
    pub async fn initialize(&self) -> Result<()> {
        self.store.initialize().await?;
        info!(backend = %self.store.status().backend, "Cache engine initialized");
        Ok(())
    }

    // =========================================================================
    // Background Loops
    // =========================================================================

    /// Spawn the background loops. Calling it while running is a no-op;
    /// after [`CacheEngine::shutdown`] it starts fresh loops.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancel = {
            let mut current = self.cancel.lock();
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
            current.clone()
        };

        let lifecycle = &self.config.lifecycle;
        self.spawn_loop(&cancel, "sweep", Duration::from_secs(lifecycle.sweep_interval_secs), |engine| async move {
            engine.lifecycle.sweep().await;
        });
        self.spawn_loop(&cancel, "health", Duration::from_secs(lifecycle.health_interval_secs), |engine| async move {
            engine.health_check().await;
        });
        self.spawn_loop(
            &cancel,
            "optimize",
            Duration::from_secs(self.config.optimizer.optimize_interval_secs),
            |engine| async move {
                engine.optimizer.optimize();
                let purged = engine.store.purge_local_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired local entries");
                }
            },
        );
        if self.config.optimizer.prefetch.enabled {
            self.spawn_loop(
                &cancel,
                "prefetch",
                Duration::from_millis(self.config.optimizer.prefetch.drain_interval_ms),
                |engine| async move {
                    engine.optimizer.drain_prefetch().await;
                },
            );
        }

        info!(loops = self.tasks.len(), "Cache engine started");
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, cancel: &CancellationToken, name: &'static str, period: Duration, tick: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let engine = Arc::clone(self);
        let cancel = cancel.clone();
        self.tasks.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick(Arc::clone(&engine)).await,
                }
            }
            debug!(task = name, "Background loop stopped");
        });
    }

    /// Cancel the background loops, wait for them and for in-flight cleanups
    pub async fn shutdown(&self) {
        let cancel = self.cancel.lock().clone();
        cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
        self.lifecycle.flush().await;
        self.running.store(false, Ordering::Release);
        info!("Cache engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // =========================================================================
    // Repository Operations
    // =========================================================================

    /// Index and warm a repository, and track it for the opening user.
    ///
    /// The known file list is written under the repository's `index` facet,
    /// which is the key the lifecycle entry owns.
    pub async fn open_repository(&self, request: OpenRepository) -> Result<OpenedRepository> {
        let paths: Vec<&str> = request.files.iter().map(|f| f.path.as_str()).collect();
        let report = self
            .optimizer
            .initialize_repository(&request.repository, request.files.clone(), request.strategy)
            .await?;

        let key = CacheKey::repo(&request.repository, INDEX_FACET).into_string();
        let ttl = request.ttl_secs.unwrap_or(self.config.lifecycle.default_ttl_secs);
        self.store.set_json(&key, &paths, Some(ttl)).await?;

        self.lifecycle.register_cache(
            &key,
            &request.user_id,
            &request.repository,
            &request.navigation_context,
            Some(ttl),
        )?;
        self.lifecycle.activate(&key)?;

        info!(
            repository = %request.repository,
            user_id = %request.user_id,
            strategy = %request.strategy,
            preloaded = report.preloaded,
            "Repository opened"
        );
        Ok(OpenedRepository { key, report })
    }

    /// Cache a serializable repository facet on behalf of a user
    pub async fn cache_repository_data<T: Serialize + ?Sized>(
        &self,
        user_id: &str,
        repository: &str,
        facet: &str,
        value: &T,
        navigation_context: &str,
        ttl_secs: Option<u64>,
    ) -> Result<String> {
        let key = CacheKey::repo(repository, facet).into_string();
        let ttl = ttl_secs.unwrap_or(self.config.lifecycle.default_ttl_secs);
        self.store.set_json(&key, value, Some(ttl)).await?;
        self.lifecycle
            .register_cache(&key, user_id, repository, navigation_context, Some(ttl))?;
        self.lifecycle.activate(&key)?;
        Ok(key)
    }

    /// Read a file, keeping the repository's lifecycle entries alive
    pub async fn get_file_content(&self, repository: &str, path: &str) -> Result<Option<FileContent>> {
        let content = self.optimizer.get_file_content(repository, path).await?;
        self.lifecycle.touch_repository(repository);
        Ok(content)
    }

    pub fn list_files(&self, repository: &str, pattern: Option<&str>, language: Option<&str>) -> Result<Vec<String>> {
        self.optimizer.list_files(repository, pattern, language)
    }

    /// Drop a repository's optimizer state and every store key under it
    pub async fn cleanup_repository(&self, repository: &str) -> Result<RepositoryCleanup> {
        let cleanup = self.optimizer.cleanup_repository(repository).await;
        self.store
            .delete_prefix(&CacheKey::repo_prefix(repository))
            .await?;
        Ok(cleanup)
    }

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    pub fn handle_navigation_event(&self, event: NavigationEvent) -> NavigationOutcome {
        self.lifecycle.handle_navigation_event(event)
    }

    pub async fn force_cleanup_user(&self, user_id: &str) -> CleanupSummary {
        self.lifecycle.force_cleanup_user(user_id).await
    }

    /// Run one lifecycle sweep outside the background loop
    pub async fn sweep(&self) -> SweepReport {
        self.lifecycle.sweep().await
    }

    /// Probe the remote store and clean aggressively above the high-water mark
    pub async fn health_check(&self) -> HealthReport {
        let report = self.store.health_check().await;
        if !report.healthy {
            return report;
        }
        match self.lifecycle.check_memory().await {
            Ok(Some(summary)) => {
                warn!(cleaned = summary.cleaned.len(), failed = summary.failed.len(), "Memory pressure relieved")
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "Memory check failed"),
        }
        report
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.is_running(),
            store: self.store.status(),
            optimizer: self.optimizer.status().await,
            lifecycle: self.lifecycle.status(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    pub fn optimizer(&self) -> &Arc<AccessOptimizer> {
        &self.optimizer
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleCoordinator> {
        &self.lifecycle
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
