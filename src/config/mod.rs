//! Configuration management.
//!
//! [`ResilienceConfig`] is built once at the composition root (defaults, an
//! optional TOML file, then environment overrides) and passed by value into
//! [`ConnectionManager`](crate::ConnectionManager). Nothing below the
//! composition root reads the environment.

mod env;
mod file;

pub use file::{
    ConfigFile, ConfigFileBreaker, ConfigFileCache, ConfigFileDatabase, ConfigFileFallbackCache,
    ConfigFileHealth,
};

use crate::{Error, Result};
use secrecy::SecretString;
use std::path::Path;
use std::time::Duration;

/// Default capacity of the connection event bus.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 256;

/// Main configuration for the resilience layer.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Relational store settings.
    pub database: DatabaseConfig,
    /// Cache store settings.
    pub cache: CacheConfig,
    /// Breaker guarding the relational store.
    pub database_breaker: CircuitBreakerConfig,
    /// Breaker guarding the cache store.
    pub cache_breaker: CircuitBreakerConfig,
    /// Health monitor settings.
    pub health: HealthMonitorConfig,
    /// In-process fallback cache settings.
    pub fallback_cache: FallbackCacheConfig,
    /// Buffer size of the connection event bus.
    pub event_bus_capacity: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            database_breaker: CircuitBreakerConfig::default()
                .with_failure_threshold(5)
                .with_reset_timeout_ms(60_000),
            cache_breaker: CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_reset_timeout_ms(30_000),
            health: HealthMonitorConfig::default(),
            fallback_cache: FallbackCacheConfig::default(),
            event_bus_capacity: DEFAULT_EVENT_BUS_CAPACITY,
        }
    }
}

impl ResilienceConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from defaults plus environment variables.
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `LOKAL_DATABASE_URL` / `DATABASE_URL` | PostgreSQL DSN | unset |
    /// | `LOKAL_DATABASE_POOL_MAX_SIZE` | Pool size | 20 |
    /// | `LOKAL_DATABASE_ACQUIRE_TIMEOUT_MS` | Connection acquire bound | 5000 |
    /// | `LOKAL_DATABASE_QUERY_TIMEOUT_MS` | Query bound | 30000 |
    /// | `LOKAL_DATABASE_SLOW_QUERY_MS` | Slow query log threshold | 5000 |
    /// | `LOKAL_REDIS_URL` / `REDIS_URL` | Redis URL | unset |
    /// | `LOKAL_REDIS_COMMAND_TIMEOUT_MS` | Command bound | 2000 |
    /// | `LOKAL_REDIS_KEY_PREFIX` | Key namespace | unset |
    /// | `LOKAL_DATABASE_BREAKER_FAILURE_THRESHOLD` | Failures to open | 5 |
    /// | `LOKAL_DATABASE_BREAKER_RESET_MS` | Open dwell time | 60000 |
    /// | `LOKAL_REDIS_BREAKER_FAILURE_THRESHOLD` | Failures to open | 3 |
    /// | `LOKAL_REDIS_BREAKER_RESET_MS` | Open dwell time | 30000 |
    /// | `LOKAL_HEALTH_INTERVAL_MS` | Probe interval | 30000 |
    /// | `LOKAL_HEALTH_FAILURE_THRESHOLD` | Failures to flip unhealthy | 3 |
    /// | `LOKAL_HEALTH_CHECK_TIMEOUT_MS` | Probe bound | 5000 |
    /// | `LOKAL_FALLBACK_CACHE_CAPACITY` | Max fallback entries | 1000 |
    /// | `LOKAL_FALLBACK_CACHE_SWEEP_MS` | Expired entry sweep | 60000 |
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        env::apply(&mut self, &env::ProcessEnv);
        self
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;

        let file: ConfigFile = toml::from_str(&contents).map_err(|e| Error::OperationFailed {
            operation: "parse_config_file".to_string(),
            cause: e.to_string(),
        })?;

        Ok(Self::from_config_file(file))
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the platform config dir first, then `~/.config/lokal/` for Unix
    /// compatibility. Returns defaults if no config file is found.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let platform_config = base_dirs.config_dir().join("lokal").join("resilience.toml");
        if platform_config.exists()
            && let Ok(config) = Self::load_from_file(&platform_config)
        {
            return config;
        }

        let xdg_config = base_dirs
            .home_dir()
            .join(".config")
            .join("lokal")
            .join("resilience.toml");
        if xdg_config.exists()
            && let Ok(config) = Self::load_from_file(&xdg_config)
        {
            return config;
        }

        Self::default()
    }

    /// Converts a parsed [`ConfigFile`] into a configuration.
    #[must_use]
    pub fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();
        file.apply(&mut config);
        config
    }

    /// Checks the configuration for values the runtime cannot honor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 10] = [
            ("database.pool_max_size", self.database.pool_max_size > 0),
            (
                "database.acquire_timeout_ms",
                self.database.acquire_timeout_ms > 0,
            ),
            ("database.query_timeout_ms", self.database.query_timeout_ms > 0),
            ("cache.command_timeout_ms", self.cache.command_timeout_ms > 0),
            (
                "database_breaker.failure_threshold",
                self.database_breaker.failure_threshold > 0,
            ),
            (
                "cache_breaker.failure_threshold",
                self.cache_breaker.failure_threshold > 0,
            ),
            ("health.interval_ms", self.health.interval_ms > 0),
            ("health.check_timeout_ms", self.health.check_timeout_ms > 0),
            ("fallback_cache.capacity", self.fallback_cache.capacity > 0),
            ("event_bus_capacity", self.event_bus_capacity > 0),
        ];

        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(Error::Configuration(format!("{field} must be > 0"))),
            None => Ok(()),
        }
    }

    /// Sets the relational store URL.
    #[must_use]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database.url = Some(SecretString::from(url.into()));
        self
    }

    /// Sets the cache store URL.
    #[must_use]
    pub fn with_cache_url(mut self, url: impl Into<String>) -> Self {
        self.cache.url = Some(SecretString::from(url.into()));
        self
    }
}

/// Relational store settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection string. `None` means the store is not configured.
    pub url: Option<SecretString>,
    /// Maximum connections held by the pool.
    pub pool_max_size: usize,
    /// Bound on waiting for, creating, or recycling a pooled connection.
    pub acquire_timeout_ms: u64,
    /// Bound on a single query, including connection acquisition.
    pub query_timeout_ms: u64,
    /// Queries slower than this are logged as slow.
    pub slow_query_threshold_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_max_size: 20,
            acquire_timeout_ms: 5_000,
            query_timeout_ms: 30_000,
            slow_query_threshold_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    /// Returns true when a connection string is present.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// Acquire timeout as a [`Duration`].
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Query timeout as a [`Duration`].
    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Slow query threshold as a [`Duration`].
    #[must_use]
    pub const fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }
}

/// Cache store settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Connection URL. `None` means the store is not configured.
    pub url: Option<SecretString>,
    /// Bound on a single cache command.
    pub command_timeout_ms: u64,
    /// Optional prefix prepended to every key.
    pub key_prefix: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            command_timeout_ms: 2_000,
            key_prefix: None,
        }
    }
}

impl CacheConfig {
    /// Returns true when a connection URL is present.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// Command timeout as a [`Duration`].
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long to stay open before admitting a trial call.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout in milliseconds.
    #[must_use]
    pub const fn with_reset_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.reset_timeout_ms = timeout_ms;
        self
    }

    /// Reset timeout as a [`Duration`].
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMonitorConfig {
    /// Interval between probe rounds.
    pub interval_ms: u64,
    /// Consecutive failures before a dependency is reported unhealthy.
    pub failure_threshold: u32,
    /// Bound on a single probe.
    pub check_timeout_ms: u64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            failure_threshold: 3,
            check_timeout_ms: 5_000,
        }
    }
}

impl HealthMonitorConfig {
    /// Sets the probe interval in milliseconds.
    #[must_use]
    pub const fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the probe timeout in milliseconds.
    #[must_use]
    pub const fn with_check_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.check_timeout_ms = timeout_ms;
        self
    }

    /// Probe interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Probe timeout as a [`Duration`].
    #[must_use]
    pub const fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

/// In-process fallback cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackCacheConfig {
    /// Maximum number of entries kept in memory.
    pub capacity: usize,
    /// Interval between sweeps that drop expired entries.
    pub sweep_interval_ms: u64,
    /// How long a value read from the remote cache is kept locally. Zero
    /// disables the copy.
    pub backfill_ttl_ms: u64,
}

impl Default for FallbackCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            sweep_interval_ms: 60_000,
            backfill_ttl_ms: 60_000,
        }
    }
}

impl FallbackCacheConfig {
    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Backfill TTL as a [`Duration`].
    #[must_use]
    pub const fn backfill_ttl(&self) -> Duration {
        Duration::from_millis(self.backfill_ttl_ms)
    }
}
