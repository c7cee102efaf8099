//! Engine Configuration
//!
//! One YAML document configures all three components. Every section is
//! optional; missing fields take their defaults.
//!
//! ```yaml
//! store:
//!   redis_url: redis://keydb:6379
//!   compression:
//!     threshold_bytes: 1024
//! optimizer:
//!   memory_ceiling_bytes: 268435456
//! lifecycle:
//!   leave_grace_secs: 30
//! ```

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleConfig;
use crate::optimizer::OptimizerConfig;
use crate::store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub optimizer: OptimizerConfig,
    pub lifecycle: LifecycleConfig,
    /// Capacity of the engine event channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            optimizer: OptimizerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Load and validate a YAML configuration file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&contents)?;
        debug!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let store = &self.store;
        ensure(!store.redis_url.is_empty(), "store.redis_url must not be empty")?;
        ensure(store.pool_size > 0, "store.pool_size must be positive")?;
        ensure(
            store.pool.max_concurrent_ops > 0,
            "store.pool.max_concurrent_ops must be positive",
        )?;
        ensure(store.pool.op_timeout_secs > 0, "store.pool.op_timeout_secs must be positive")?;
        ensure(
            store.pool.retry_initial_ms <= store.pool.retry_max_ms,
            "store.pool.retry_initial_ms must not exceed retry_max_ms",
        )?;
        ensure(store.compression.level <= 9, "store.compression.level must be 0-9")?;
        ensure(
            store.local_capacity_entries > 0,
            "store.local_capacity_entries must be positive",
        )?;
        ensure(store.scan_batch > 0, "store.scan_batch must be positive")?;

        let optimizer = &self.optimizer;
        ensure(
            optimizer.memory_ceiling_bytes > 0,
            "optimizer.memory_ceiling_bytes must be positive",
        )?;
        ensure(
            optimizer.eviction_target_ratio > 0.0 && optimizer.eviction_target_ratio <= 1.0,
            "optimizer.eviction_target_ratio must be in (0, 1]",
        )?;
        ensure(
            optimizer.overflow_evict_fraction > 0.0 && optimizer.overflow_evict_fraction <= 1.0,
            "optimizer.overflow_evict_fraction must be in (0, 1]",
        )?;
        ensure(
            optimizer.adaptive.eager_above > optimizer.adaptive.predictive_above,
            "optimizer.adaptive.eager_above must be greater than predictive_above",
        )?;
        ensure(
            optimizer.patterns.frequent_interval_secs <= optimizer.patterns.clustered_interval_secs,
            "optimizer.patterns.frequent_interval_secs must not exceed clustered_interval_secs",
        )?;
        ensure(
            optimizer.patterns.clustered_min_count <= optimizer.patterns.clustered_max_count,
            "optimizer.patterns.clustered_min_count must not exceed clustered_max_count",
        )?;
        ensure(
            optimizer.optimize_interval_secs > 0,
            "optimizer.optimize_interval_secs must be positive",
        )?;
        ensure(
            optimizer.prefetch.drain_interval_ms > 0,
            "optimizer.prefetch.drain_interval_ms must be positive",
        )?;

        let lifecycle = &self.lifecycle;
        ensure(lifecycle.default_ttl_secs > 0, "lifecycle.default_ttl_secs must be positive")?;
        ensure(
            lifecycle.sweep_interval_secs > 0,
            "lifecycle.sweep_interval_secs must be positive",
        )?;
        ensure(
            lifecycle.health_interval_secs > 0,
            "lifecycle.health_interval_secs must be positive",
        )?;
        ensure(
            lifecycle.aggressive_cleanup_fraction > 0.0 && lifecycle.aggressive_cleanup_fraction <= 1.0,
            "lifecycle.aggressive_cleanup_fraction must be in (0, 1]",
        )?;
        ensure(!lifecycle.hub_paths.is_empty(), "lifecycle.hub_paths must not be empty")?;
        ensure(self.event_capacity > 0, "event_capacity must be positive")?;

        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Configuration(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();

        assert_eq!(config.store.compression.threshold_bytes, 1024);
        assert_eq!(config.lifecycle.leave_grace_secs, 30);
        assert_eq!(config.lifecycle.preserve_window_secs, 300);
        assert_eq!(config.lifecycle.stale_session_secs, 1800);
        assert_eq!(config.optimizer.strategy.predictive_max_files, 20);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = EngineConfig::from_yaml_str(
            r#"
store:
  redis_url: redis://keydb:6379
lifecycle:
  leave_grace_secs: 45
"#,
        )
        .unwrap();

        assert_eq!(config.store.redis_url, "redis://keydb:6379");
        assert_eq!(config.store.pool_size, 4);
        assert_eq!(config.lifecycle.leave_grace_secs, 45);
        assert_eq!(config.lifecycle.sweep_interval_secs, 10);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = EngineConfig::from_yaml_str(
            r#"
optimizer:
  eviction_target_ratio: 1.5
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = EngineConfig::from_yaml_str(
            r#"
optimizer:
  adaptive:
    eager_above: 2.0
    predictive_above: 5.0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("eager_above"));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "store:\n  scan_batch: 250").unwrap();

        let config = EngineConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.store.scan_batch, 250);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::from_yaml_file("/nonexistent/engine.yaml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
