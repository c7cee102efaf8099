//! Connection Pool Layer
//!
//! Every remote operation goes through [`ConnectionPool::run`], which
//! enforces the concurrency ceiling, applies the per-operation timeout and
//! retries transient failures with bounded exponential backoff. Timeouts are
//! reported to the caller and never retried here.

use crate::error::{Error, Result};
use crate::store::metrics::StoreMetrics;
use crate::store::remote::RemoteStore;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

// =============================================================================
// Pool Configuration
// =============================================================================

/// Retry and concurrency settings for remote operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum remote operations in flight
    pub max_concurrent_ops: usize,
    /// Timeout applied to each attempt, in seconds
    pub op_timeout_secs: u64,
    /// First retry delay, in milliseconds
    pub retry_initial_ms: u64,
    /// Upper bound for a single retry delay, in milliseconds
    pub retry_max_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 32,
            op_timeout_secs: 30,
            retry_initial_ms: 50,
            retry_max_ms: 2_000,
            max_retries: 3,
        }
    }
}

impl PoolConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

// =============================================================================
// Connection Pool
// =============================================================================

/// Bounded gateway to the remote store
pub struct ConnectionPool {
    remote: Arc<dyn RemoteStore>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
    metrics: Arc<StoreMetrics>,
    reinitializing: AtomicBool,
}

impl ConnectionPool {
    pub fn new(remote: Arc<dyn RemoteStore>, config: PoolConfig, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_ops.max(1))),
            remote,
            config,
            metrics,
            reinitializing: AtomicBool::new(false),
        }
    }

    /// Backend name
    pub fn backend(&self) -> &'static str {
        self.remote.name()
    }

    /// Permits currently free
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a remote operation under the pool's ceiling, timeout and retry policy
    pub async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn RemoteStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::StoreUnavailable("connection pool closed".to_string()))?;

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.retry_initial_ms))
            .with_max_interval(Duration::from_millis(self.config.retry_max_ms))
            .with_max_elapsed_time(None)
            .build();

        let timeout = self.config.op_timeout();
        let max_retries = self.config.max_retries;
        let attempts = AtomicU32::new(0);

        let result = backoff::future::retry(policy, || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed);
            let fut = op(self.remote.clone());
            async move {
                if attempt > 0 {
                    self.metrics.record_retry();
                    debug!(operation, attempt, "Retrying remote operation");
                }

                let outcome = match tokio::time::timeout(timeout, fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        self.metrics.record_timeout();
                        Err(Error::Timeout {
                            operation: operation.to_string(),
                            timeout,
                        })
                    }
                };

                outcome.map_err(|e| {
                    if e.is_transient() && attempt < max_retries {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await;

        if let Err(e) = &result {
            self.metrics.record_error();
            debug!(operation, error = %e, "Remote operation failed");
        }
        result
    }

    /// Re-establish the remote connection.
    ///
    /// Concurrent callers coalesce: only one reconnect runs at a time and the
    /// others return immediately.
    pub async fn reinitialize(&self) -> Result<bool> {
        if self
            .reinitializing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        self.metrics.record_reinitialization();
        let result = tokio::time::timeout(self.config.op_timeout(), self.remote.connect()).await;
        self.reinitializing.store(false, Ordering::Release);

        match result {
            Ok(Ok(())) => {
                info!(backend = self.backend(), "Remote store connection re-initialised");
                Ok(true)
            }
            Ok(Err(e)) => {
                warn!(backend = self.backend(), error = %e, "Remote store re-initialisation failed");
                Err(e)
            }
            Err(_) => Err(Error::Timeout {
                operation: "reconnect".to_string(),
                timeout: self.config.op_timeout(),
            }),
        }
    }

    /// Connect for the first time
    pub async fn connect(&self) -> Result<()> {
        match tokio::time::timeout(self.config.op_timeout(), self.remote.connect()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: "connect".to_string(),
                timeout: self.config.op_timeout(),
            }),
        }
    }
}
