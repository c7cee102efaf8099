//! Telemetry
//!
//! Logging setup for the binary and prometheus gauges refreshed from
//! [`EngineStatus`].

use crate::engine::EngineStatus;
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleState;
use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// Logging Setup
// =============================================================================

/// Install the global subscriber. `RUST_LOG` directives refine `level`.
pub fn init_logging(level: &str, json: bool) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "fred=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Prometheus Gauges
// =============================================================================

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registry: {}", e))
}

/// Gauges mirroring the engine status
pub struct EngineMetrics {
    registry: Registry,
    store_degraded: IntGauge,
    store_hits: IntGaugeVec,
    store_misses: IntGauge,
    store_bytes_stored: IntGauge,
    store_errors: IntGauge,
    store_retries: IntGauge,
    local_entries: IntGauge,
    resident_files: IntGauge,
    resident_bytes: IntGauge,
    memory_ceiling_bytes: IntGauge,
    optimizer_hit_ratio: Gauge,
    evictions: IntGauge,
    pending_prefetch: IntGauge,
    repository_resident_bytes: IntGaugeVec,
    repository_hit_ratio: GaugeVec,
    lifecycle_entries: IntGaugeVec,
    sessions: IntGauge,
    pending_cleanups: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("smart_repo_cache".to_string()), None).map_err(metric_error)?;

        let int_gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::new(name, help).map_err(metric_error)?;
            registry.register(Box::new(gauge.clone())).map_err(metric_error)?;
            Ok(gauge)
        };
        let int_gauge_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntGaugeVec> {
            let gauge = IntGaugeVec::new(Opts::new(name, help), labels).map_err(metric_error)?;
            registry.register(Box::new(gauge.clone())).map_err(metric_error)?;
            Ok(gauge)
        };

        let optimizer_hit_ratio =
            Gauge::new("optimizer_hit_ratio", "Virtual file hit ratio").map_err(metric_error)?;
        registry
            .register(Box::new(optimizer_hit_ratio.clone()))
            .map_err(metric_error)?;
        let repository_hit_ratio = GaugeVec::new(
            Opts::new("repository_hit_ratio", "Virtual file hit ratio per repository"),
            &["repository"],
        )
        .map_err(metric_error)?;
        registry
            .register(Box::new(repository_hit_ratio.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            store_degraded: int_gauge("store_degraded", "1 while the remote store is degraded")?,
            store_hits: int_gauge_vec("store_hits", "Store hits by tier", &["tier"])?,
            store_misses: int_gauge("store_misses", "Store misses")?,
            store_bytes_stored: int_gauge("store_bytes_stored", "Bytes written to the remote store after compression")?,
            store_errors: int_gauge("store_errors", "Remote store errors")?,
            store_retries: int_gauge("store_retries", "Remote operation retries")?,
            local_entries: int_gauge("local_entries", "Entries in the in-process tier")?,
            resident_files: int_gauge("resident_files", "Resident virtual files")?,
            resident_bytes: int_gauge("resident_bytes", "Resident virtual file bytes")?,
            memory_ceiling_bytes: int_gauge("memory_ceiling_bytes", "Resident byte ceiling")?,
            evictions: int_gauge("evictions", "Virtual files evicted")?,
            pending_prefetch: int_gauge("pending_prefetch", "Files waiting in the prefetch queue")?,
            repository_resident_bytes: int_gauge_vec(
                "repository_resident_bytes",
                "Resident virtual file bytes per repository",
                &["repository", "strategy"],
            )?,
            lifecycle_entries: int_gauge_vec("lifecycle_entries", "Lifecycle entries by state", &["state"])?,
            sessions: int_gauge("sessions", "Tracked navigation sessions")?,
            pending_cleanups: int_gauge("pending_cleanups", "Delayed cleanups waiting to run")?,
            optimizer_hit_ratio,
            repository_hit_ratio,
            registry,
        })
    }

    /// Refresh every gauge from a status snapshot
    pub fn update(&self, status: &EngineStatus) {
        let store = &status.store;
        self.store_degraded.set(i64::from(store.degraded));
        self.store_hits
            .with_label_values(&["local"])
            .set(store.metrics.local_hits as i64);
        self.store_hits
            .with_label_values(&["remote"])
            .set(store.metrics.remote_hits as i64);
        self.store_misses.set(store.metrics.misses as i64);
        self.store_bytes_stored.set(store.metrics.bytes_stored as i64);
        self.store_errors.set(store.metrics.errors as i64);
        self.store_retries.set(store.metrics.retries as i64);
        self.local_entries.set(store.local_entries as i64);

        let optimizer = &status.optimizer;
        self.resident_files.set(optimizer.resident_files as i64);
        self.resident_bytes.set(optimizer.resident_bytes as i64);
        self.memory_ceiling_bytes.set(optimizer.memory_ceiling_bytes as i64);
        self.optimizer_hit_ratio.set(optimizer.hit_ratio);
        self.evictions.set(optimizer.evictions as i64);
        self.pending_prefetch.set(optimizer.pending_prefetch as i64);

        // Cleaned-up repositories disappear from the label sets
        self.repository_resident_bytes.reset();
        self.repository_hit_ratio.reset();
        for repository in &optimizer.repositories {
            let strategy = repository.effective_strategy.to_string();
            self.repository_resident_bytes
                .with_label_values(&[repository.repository.as_str(), strategy.as_str()])
                .set(repository.resident_bytes as i64);
            self.repository_hit_ratio
                .with_label_values(&[repository.repository.as_str()])
                .set(repository.hit_ratio);
        }

        let lifecycle = &status.lifecycle;
        for state in LifecycleState::ALL {
            let count = lifecycle.by_state.get(&state).copied().unwrap_or(0);
            self.lifecycle_entries
                .with_label_values(&[state.to_string().as_str()])
                .set(count as i64);
        }
        self.sessions.set(lifecycle.sessions as i64);
        self.pending_cleanups.set(lifecycle.pending_cleanups as i64);
    }

    /// Render the registry in the prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
