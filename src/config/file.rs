//! Configuration file structure (for TOML parsing).

use super::{CircuitBreakerConfig, ResilienceConfig};
use secrecy::SecretString;
use serde::Deserialize;

/// Configuration file root.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Relational store section.
    pub database: Option<ConfigFileDatabase>,
    /// Cache store section.
    pub cache: Option<ConfigFileCache>,
    /// Relational breaker section.
    pub database_breaker: Option<ConfigFileBreaker>,
    /// Cache breaker section.
    pub cache_breaker: Option<ConfigFileBreaker>,
    /// Health monitor section.
    pub health: Option<ConfigFileHealth>,
    /// Fallback cache section.
    pub fallback_cache: Option<ConfigFileFallbackCache>,
    /// Event bus buffer size.
    pub event_bus_capacity: Option<usize>,
}

/// `[database]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileDatabase {
    /// Connection string.
    pub url: Option<String>,
    /// Pool size.
    pub pool_max_size: Option<usize>,
    /// Acquire timeout.
    pub acquire_timeout_ms: Option<u64>,
    /// Query timeout.
    pub query_timeout_ms: Option<u64>,
    /// Slow query threshold.
    pub slow_query_threshold_ms: Option<u64>,
}

/// `[cache]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileCache {
    /// Connection URL.
    pub url: Option<String>,
    /// Command timeout.
    pub command_timeout_ms: Option<u64>,
    /// Key prefix.
    pub key_prefix: Option<String>,
}

/// `[database_breaker]` / `[cache_breaker]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileBreaker {
    /// Failures before opening.
    pub failure_threshold: Option<u32>,
    /// Open dwell time.
    pub reset_timeout_ms: Option<u64>,
}

/// `[health]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileHealth {
    /// Probe interval.
    pub interval_ms: Option<u64>,
    /// Failures before unhealthy.
    pub failure_threshold: Option<u32>,
    /// Probe timeout.
    pub check_timeout_ms: Option<u64>,
}

/// `[fallback_cache]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileFallbackCache {
    /// Maximum entries.
    pub capacity: Option<usize>,
    /// Sweep interval.
    pub sweep_interval_ms: Option<u64>,
    /// TTL of values copied from the remote cache.
    pub backfill_ttl_ms: Option<u64>,
}

impl ConfigFileBreaker {
    fn apply(self, breaker: &mut CircuitBreakerConfig) {
        if let Some(v) = self.failure_threshold {
            breaker.failure_threshold = v.max(1);
        }
        if let Some(v) = self.reset_timeout_ms {
            breaker.reset_timeout_ms = v;
        }
    }
}

impl ConfigFile {
    /// Overlays every present value onto `config`.
    pub(super) fn apply(self, config: &mut ResilienceConfig) {
        if let Some(database) = self.database {
            if let Some(url) = database.url {
                config.database.url = Some(SecretString::from(url));
            }
            if let Some(v) = database.pool_max_size {
                config.database.pool_max_size = v;
            }
            if let Some(v) = database.acquire_timeout_ms {
                config.database.acquire_timeout_ms = v;
            }
            if let Some(v) = database.query_timeout_ms {
                config.database.query_timeout_ms = v;
            }
            if let Some(v) = database.slow_query_threshold_ms {
                config.database.slow_query_threshold_ms = v;
            }
        }

        if let Some(cache) = self.cache {
            if let Some(url) = cache.url {
                config.cache.url = Some(SecretString::from(url));
            }
            if let Some(v) = cache.command_timeout_ms {
                config.cache.command_timeout_ms = v;
            }
            config.cache.key_prefix = cache.key_prefix.or(config.cache.key_prefix.take());
        }

        if let Some(breaker) = self.database_breaker {
            breaker.apply(&mut config.database_breaker);
        }
        if let Some(breaker) = self.cache_breaker {
            breaker.apply(&mut config.cache_breaker);
        }

        if let Some(health) = self.health {
            if let Some(v) = health.interval_ms {
                config.health.interval_ms = v;
            }
            if let Some(v) = health.failure_threshold {
                config.health.failure_threshold = v.max(1);
            }
            if let Some(v) = health.check_timeout_ms {
                config.health.check_timeout_ms = v;
            }
        }

        if let Some(fallback) = self.fallback_cache {
            if let Some(v) = fallback.capacity {
                config.fallback_cache.capacity = v;
            }
            if let Some(v) = fallback.sweep_interval_ms {
                config.fallback_cache.sweep_interval_ms = v;
            }
            if let Some(v) = fallback.backfill_ttl_ms {
                config.fallback_cache.backfill_ttl_ms = v;
            }
        }

        if let Some(v) = self.event_bus_capacity {
            config.event_bus_capacity = v;
        }
    }
}
