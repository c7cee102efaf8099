//! Remote Store Backends
//!
//! The [`RemoteStore`] port is the only surface the engine needs from the
//! remote key-value store: GET, SET with TTL, DEL, cursor-based SCAN by key
//! prefix, TTL lookup and an INFO/health probe reporting used memory.
//!
//! [`KeyDbStore`] talks to KeyDB/Redis through a `fred` pool.
//! [`InMemoryRemoteStore`] is a process-local backend used by tests and by the
//! binary's `--in-memory` mode.

use crate::clock::{clamp_ttl_secs, secs, ClockRef};
use crate::error::{Error, Result};
use crate::store::tiered::StoreConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fred::clients::Pool;
use fred::error::{Error as FredError, ErrorKind};
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy};
use fred::types::{CustomCommand, Expiration};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// RemoteStore Trait
// =============================================================================

/// Trait for the remote key-value store
///
/// Values are opaque text payloads; compression and encoding happen above
/// this layer.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Backend name for logs and status
    fn name(&self) -> &'static str;

    /// Establish (or re-establish) the connection
    async fn connect(&self) -> Result<()>;

    /// Get a value by key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, with an expiry in seconds or none
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// One cursor step over keys starting with `prefix`.
    ///
    /// Returns the next cursor (0 when the iteration is complete) and the
    /// keys found in this step.
    async fn scan_prefix(&self, cursor: u64, prefix: &str, count: u64) -> Result<(u64, Vec<String>)>;

    /// Remaining time to live in seconds (None = no expiry or missing key)
    async fn ttl(&self, key: &str) -> Result<Option<u64>>;

    /// Round-trip probe
    async fn ping(&self) -> Result<()>;

    /// Memory used by the store, in bytes
    async fn used_memory(&self) -> Result<u64>;
}

/// Escape glob metacharacters for a Redis MATCH pattern
pub fn escape_match_pattern(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

/// Extract `used_memory` from an `INFO memory` reply
pub fn parse_used_memory(info: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("used_memory:"))
        .and_then(|value| value.trim().parse().ok())
}

// =============================================================================
// KeyDB / Redis Backend
// =============================================================================

/// Connection settings for [`KeyDbStore`]
#[derive(Debug, Clone)]
pub struct KeyDbConfig {
    /// `redis://` or `rediss://` URL
    pub url: String,
    /// Number of pooled clients
    pub pool_size: usize,
    /// How long the initial connection may take
    pub connect_timeout: Duration,
}

impl From<&StoreConfig> for KeyDbConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            url: config.redis_url.clone(),
            pool_size: config.pool_size,
            connect_timeout: config.connect_timeout(),
        }
    }
}

fn map_fred_error(operation: &str, err: FredError) -> Error {
    match err.kind() {
        ErrorKind::IO | ErrorKind::Timeout | ErrorKind::Canceled | ErrorKind::Backpressure => {
            Error::StoreUnavailable(format!("{} failed: {}", operation, err))
        }
        ErrorKind::Parse => Error::serialization(operation, err),
        _ => Error::Internal(format!("{} failed: {}", operation, err)),
    }
}

/// KeyDB/Redis backend over a `fred` client pool
pub struct KeyDbStore {
    config: KeyDbConfig,
    pool: RwLock<Option<Pool>>,
}

impl KeyDbStore {
    /// Create a store; no connection is made until [`RemoteStore::connect`]
    pub fn new(config: KeyDbConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
        }
    }

    fn pool(&self) -> Result<Pool> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| Error::StoreUnavailable("KeyDB pool not initialised".to_string()))
    }

    async fn build_pool(&self) -> Result<Pool> {
        let fred_config = FredConfig::from_url(&self.config.url)
            .map_err(|e| Error::Configuration(format!("invalid KeyDB URL: {}", e)))?;

        let mut builder = fred::types::Builder::from_config(fred_config);
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

        let pool = builder
            .build_pool(self.config.pool_size.max(1))
            .map_err(|e| map_fred_error("build pool", e))?;

        tokio::time::timeout(self.config.connect_timeout, pool.init())
            .await
            .map_err(|_| Error::Timeout {
                operation: "connect".to_string(),
                timeout: self.config.connect_timeout,
            })?
            .map_err(|e| map_fred_error("connect", e))?;

        Ok(pool)
    }
}

#[async_trait]
impl RemoteStore for KeyDbStore {
    fn name(&self) -> &'static str {
        "keydb"
    }

    async fn connect(&self) -> Result<()> {
        let pool = self.build_pool().await?;
        let previous = self.pool.write().replace(pool);

        if let Some(old) = previous {
            if let Err(e) = old.quit().await {
                debug!(error = %e, "Failed to close previous KeyDB pool");
            }
        }

        info!(pool_size = self.config.pool_size, "KeyDB pool initialised");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let pool = self.pool()?;
        pool.get::<Option<String>, _>(key)
            .await
            .map_err(|e| map_fred_error("GET", e))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let pool = self.pool()?;
        let expiration = ttl_secs.map(|ttl| Expiration::EX(clamp_ttl_secs(ttl)));
        let _: () = pool
            .set(key, value, expiration, None, false)
            .await
            .map_err(|e| map_fred_error("SET", e))?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let pool = self.pool()?;
        let removed: i64 = pool
            .del(keys.to_vec())
            .await
            .map_err(|e| map_fred_error("DEL", e))?;
        Ok(removed.max(0) as u64)
    }

    async fn scan_prefix(&self, cursor: u64, prefix: &str, count: u64) -> Result<(u64, Vec<String>)> {
        let pool = self.pool()?;
        let args = vec![
            cursor.to_string(),
            "MATCH".to_string(),
            escape_match_pattern(prefix),
            "COUNT".to_string(),
            count.max(1).to_string(),
        ];
        let (next, keys): (String, Vec<String>) = pool
            .custom(CustomCommand::new_static("SCAN", None::<u16>, false), args)
            .await
            .map_err(|e| map_fred_error("SCAN", e))?;

        let next = next
            .parse::<u64>()
            .map_err(|e| Error::serialization("SCAN cursor", e))?;
        Ok((next, keys))
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let pool = self.pool()?;
        let remaining: i64 = pool
            .ttl(key)
            .await
            .map_err(|e| map_fred_error("TTL", e))?;
        // -1 = no expiry, -2 = missing key
        Ok((remaining > 0).then_some(remaining as u64))
    }

    async fn ping(&self) -> Result<()> {
        let pool = self.pool()?;
        let _: String = pool
            .ping(None)
            .await
            .map_err(|e| map_fred_error("PING", e))?;
        Ok(())
    }

    async fn used_memory(&self) -> Result<u64> {
        let pool = self.pool()?;
        let info: String = pool
            .custom(
                CustomCommand::new_static("INFO", None::<u16>, false),
                vec!["memory".to_string()],
            )
            .await
            .map_err(|e| map_fred_error("INFO", e))?;

        parse_used_memory(&info)
            .ok_or_else(|| Error::serialization("INFO memory", "missing used_memory field"))
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
    /// Insertion order, used as the scan cursor
    seq: u64,
}

/// Process-local remote store with failure injection
pub struct InMemoryRemoteStore {
    values: Mutex<BTreeMap<String, StoredValue>>,
    clock: ClockRef,
    available: AtomicBool,
    /// Number of upcoming operations that fail as unavailable
    fail_next: AtomicU64,
    /// GET calls served, for tests
    get_calls: AtomicU64,
    next_seq: AtomicU64,
}

impl InMemoryRemoteStore {
    /// Create an empty store reading expiry against `clock`
    pub fn new(clock: ClockRef) -> Self {
        Self {
            values: Mutex::new(BTreeMap::new()),
            clock,
            available: AtomicBool::new(true),
            fail_next: AtomicU64::new(0),
            get_calls: AtomicU64::new(0),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Make the next `count` operations fail as unavailable
    pub fn fail_next(&self, count: u64) {
        self.fail_next.store(count, Ordering::Relaxed);
    }

    /// Number of GET calls served so far
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.values
            .lock()
            .values()
            .filter(|v| !Self::expired(v, now))
            .count()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw stored value, bypassing failure injection
    pub fn raw(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).map(|v| v.value.clone())
    }

    fn expired(value: &StoredValue, now: DateTime<Utc>) -> bool {
        value.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    fn check_available(&self, operation: &str) -> Result<()> {
        if !self.available.load(Ordering::Relaxed) {
            return Err(Error::StoreUnavailable(format!("{}: store offline", operation)));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::StoreUnavailable(format!("{}: injected failure", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn connect(&self) -> Result<()> {
        self.check_available("connect")
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available("GET")?;
        self.get_calls.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now();
        let mut values = self.values.lock();
        match values.get(key) {
            Some(v) if Self::expired(v, now) => {
                values.remove(key);
                Ok(None)
            }
            Some(v) => Ok(Some(v.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        self.check_available("SET")?;
        let expires_at = ttl_secs.map(|ttl| self.clock.now() + secs(ttl));
        let mut values = self.values.lock();
        // Overwrites keep their scan position
        let seq = match values.get(key) {
            Some(existing) => existing.seq,
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        values.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
                seq,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.check_available("DEL")?;
        let mut values = self.values.lock();
        Ok(keys.iter().filter(|k| values.remove(*k).is_some()).count() as u64)
    }

    async fn scan_prefix(&self, cursor: u64, prefix: &str, count: u64) -> Result<(u64, Vec<String>)> {
        self.check_available("SCAN")?;
        let now = self.clock.now();
        let values = self.values.lock();

        // Cursor is the next insertion sequence to visit, so keys deleted
        // between steps never shift the iteration. Like SCAN, a step may
        // return fewer matches than `count`.
        let step = count.max(1) as usize;
        let mut window: Vec<(&String, &StoredValue)> =
            values.iter().filter(|(_, v)| v.seq >= cursor).collect();
        window.sort_by_key(|(_, v)| v.seq);
        let exhausted = window.len() <= step;
        window.truncate(step);

        let keys = window
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && !Self::expired(v, now))
            .map(|(k, _)| (*k).clone())
            .collect();

        let next = match window.last() {
            Some((_, v)) if !exhausted => v.seq + 1,
            _ => 0,
        };
        Ok((next, keys))
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        self.check_available("TTL")?;
        let now = self.clock.now();
        Ok(self.values.lock().get(key).and_then(|v| {
            v.expires_at
                .map(|at| (at - now).num_milliseconds())
                .filter(|remaining| *remaining > 0)
                .map(|remaining| (remaining as u64).div_ceil(1000))
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.check_available("PING")
    }

    async fn used_memory(&self) -> Result<u64> {
        self.check_available("INFO")?;
        Ok(self
            .values
            .lock()
            .iter()
            .map(|(k, v)| (k.len() + v.value.len()) as u64)
            .sum())
    }
}
