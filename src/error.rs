//! Error types for the cache engine
//!
//! Provides structured error types for the tiered store, the access-pattern
//! optimizer and the lifecycle coordinator, plus the retry classification the
//! connection pool relies on.

use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Unified error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Remote Store Errors
    // =========================================================================
    #[error("Remote store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Remote store operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Serialization error for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Repository not initialized: {0}")]
    InvalidRepository(String),

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    #[error("Capacity exceeded: need {requested} bytes, ceiling {ceiling} bytes")]
    CapacityExceeded { requested: u64, ceiling: u64 },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Invalid lifecycle transition for {key}: {from} -> {to}")]
    InvalidTransition { key: String, from: String, to: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after specific duration
    RetryAfter(Duration),
    /// Don't retry
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Connection dropped or refused - the pool retries
            Error::StoreUnavailable(_) => ErrorAction::RetryWithBackoff,

            // Timeouts are surfaced to the caller, who may try again later
            Error::Timeout { .. } => ErrorAction::RetryAfter(Duration::from_secs(5)),

            // Memory pressure usually clears after the next eviction pass
            Error::CapacityExceeded { .. } => ErrorAction::RetryAfter(Duration::from_secs(30)),

            Error::Serialization { .. }
            | Error::NotFound(_)
            | Error::InvalidRepository(_)
            | Error::InvalidTransition { .. }
            | Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRetry,

            Error::Internal(_) | Error::Io(_) => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient (retried inside the connection pool)
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }

    /// Check if this error means "absent" rather than "broken"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Build a serialization error for a key
    pub fn serialization(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Serialization {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Best-Effort Handling
// =============================================================================

/// Explicit marker for speculative work whose failure must never reach a caller.
///
/// Prefetching and other warm-up paths use this instead of discarding errors,
/// so intentional swallowing stays greppable and is always logged.
pub trait BestEffort<T> {
    /// Convert the result into an option, logging the error under `operation`
    fn best_effort(self, operation: &str) -> Option<T>;
}

impl<T> BestEffort<T> for Result<T> {
    fn best_effort(self, operation: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(operation = operation, error = %e, "Best-effort operation failed");
                None
            }
        }
    }
}
