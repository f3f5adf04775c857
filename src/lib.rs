//! # Lokal Resilience
//!
//! Keeps a service answering requests while its PostgreSQL and Redis
//! dependencies are slow, flapping, or down.
//!
//! ## Features
//!
//! - Per-dependency circuit breakers with a single half-open trial
//! - Health monitoring with consecutive-failure hysteresis
//! - Two-tier caching: Redis first, bounded in-process fallback second
//! - Fail-fast relational queries with slow-query instrumentation
//! - Connection state events on a broadcast event bus
//!
//! ## Example
//!
//! ```rust,ignore
//! use lokal_resilience::{ConnectionManager, ResilienceConfig};
//! use std::time::Duration;
//!
//! let config = ResilienceConfig::from_env();
//! let manager = ConnectionManager::new(config)?;
//! manager.initialize().await;
//!
//! manager.cache_set("video:42:detections", &payload, Duration::from_secs(300)).await;
//! let rows = manager.query("SELECT id FROM videos WHERE id = $1", &[42.into()]).await?;
//!
//! manager.shutdown().await;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod models;
pub mod observability;
pub mod resilience;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use config::{
    CacheConfig, CircuitBreakerConfig, DatabaseConfig, FallbackCacheConfig, HealthMonitorConfig,
    ResilienceConfig,
};
pub use models::{ConnectionEvent, ConnectionState, DependencyState, EventMeta};
pub use observability::EventBus;
pub use resilience::{
    CircuitBreaker, CircuitBreakerStats, CircuitState, HealthCheckSnapshot, HealthMonitor,
    HealthStatus,
};
pub use services::{ConnectionManager, ConnectionManagerBuilder, ConnectionSummary};
pub use storage::{CacheStore, FallbackCache, PoolStats, RelationalStore, Row};

/// Error type for resilience layer operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `CircuitOpen` | A breaker is open and its cooldown has not elapsed |
/// | `DependencyUnavailable` | A store was never configured or is absent |
/// | `OperationFailed` | The guarded operation itself failed (SQL error, I/O error) |
/// | `Timeout` | A pool acquire, query, command, or probe exceeded its bound |
/// | `Configuration` | Invalid configuration or duplicate health check registration |
/// | `InvalidInput` | Unknown health check name, unserializable cache payload |
/// | `FeatureNotEnabled` | A URL is configured for a backend compiled out |
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// The circuit breaker guarding a dependency is open.
    ///
    /// Callers should treat this as "dependency currently unavailable, try
    /// later", never as a data error.
    #[error("circuit breaker open for '{dependency}' (retry in {retry_after_ms}ms)")]
    CircuitOpen {
        /// The guarded dependency.
        dependency: String,
        /// Milliseconds until the breaker admits a trial call.
        retry_after_ms: u64,
    },

    /// The dependency was never configured or its client is absent.
    ///
    /// Unlike `CircuitOpen`, no recovery timer applies.
    #[error("dependency '{dependency}' unavailable: {reason}")]
    DependencyUnavailable {
        /// The missing dependency.
        dependency: String,
        /// Why it is unavailable.
        reason: String,
    },

    /// An operation failed.
    ///
    /// Raised when:
    /// - A SQL statement fails
    /// - A Redis command fails
    /// - A health probe reports failure
    /// - A pool cannot hand out a connection
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// An operation exceeded its time bound.
    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The bound that was exceeded.
        timeout_ms: u64,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Feature not enabled (requires feature flag).
    #[error("feature not enabled: {0} (compile with --features {0})")]
    FeatureNotEnabled(String),
}

impl Error {
    /// Returns true for outages a caller may retry later.
    ///
    /// Upstream layers map these to a "temporarily unavailable" response
    /// instead of a generic server error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::DependencyUnavailable { .. } | Self::Timeout { .. }
        )
    }

    /// Returns true if this error was produced by an open circuit breaker.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// Result type alias for resilience layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds.
///
/// Falls back to 0 if the system clock is before the Unix epoch.
///
/// # Examples
///
/// ```rust
/// use lokal_resilience::current_timestamp;
///
/// let ts = current_timestamp();
/// assert!(ts > 0);
/// ```
#[must_use]
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
