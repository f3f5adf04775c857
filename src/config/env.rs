//! Environment variable overrides.

use super::ResilienceConfig;
use secrecy::SecretString;

/// Source of environment values.
///
/// Abstracted so overrides can be tested without mutating the process
/// environment.
pub(super) trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
pub(super) struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

fn parsed<T: std::str::FromStr>(env: &impl EnvSource, key: &str) -> Option<T> {
    env.var(key).and_then(|v| v.trim().parse::<T>().ok())
}

/// Applies every recognized `LOKAL_*` variable to `config`.
pub(super) fn apply(config: &mut ResilienceConfig, env: &impl EnvSource) {
    if let Some(url) = env
        .var("LOKAL_DATABASE_URL")
        .or_else(|| env.var("DATABASE_URL"))
    {
        config.database.url = Some(SecretString::from(url));
    }
    if let Some(v) = parsed::<usize>(env, "LOKAL_DATABASE_POOL_MAX_SIZE") {
        config.database.pool_max_size = v.max(1);
    }
    if let Some(v) = parsed::<u64>(env, "LOKAL_DATABASE_ACQUIRE_TIMEOUT_MS") {
        config.database.acquire_timeout_ms = v.max(1);
    }
    if let Some(v) = parsed::<u64>(env, "LOKAL_DATABASE_QUERY_TIMEOUT_MS") {
        config.database.query_timeout_ms = v.max(1);
    }
    if let Some(v) = parsed::<u64>(env, "LOKAL_DATABASE_SLOW_QUERY_MS") {
        config.database.slow_query_threshold_ms = v;
    }

    if let Some(url) = env.var("LOKAL_REDIS_URL").or_else(|| env.var("REDIS_URL")) {
        config.cache.url = Some(SecretString::from(url));
    }
    if let Some(v) = parsed::<u64>(env, "LOKAL_REDIS_COMMAND_TIMEOUT_MS") {
        config.cache.command_timeout_ms = v.max(1);
    }
    if let Some(prefix) = env.var("LOKAL_REDIS_KEY_PREFIX") {
        config.cache.key_prefix = Some(prefix);
    }

    if let Some(v) = parsed::<u32>(env, "LOKAL_DATABASE_BREAKER_FAILURE_THRESHOLD") {
        config.database_breaker.failure_threshold = v.max(1);
    }
    if let Some(v) = parsed::<u64>(env, "LOKAL_DATABASE_BREAKER_RESET_MS") {
        config.database_breaker.reset_timeout_ms = v;
    }
    if let Some(v) = parsed::<u32>(env, "LOKAL_REDIS_BREAKER_FAILURE_THRESHOLD") {
        config.cache_breaker.failure_threshold = v.max(1);
    }
    if let Some(v) = parsed::<u64>(env, "LOKAL_REDIS_BREAKER_RESET_MS") {
        config.cache_breaker.reset_timeout_ms = v;
    }

    if let Some(v) = parsed::<u64>(env, "LOKAL_HEALTH_INTERVAL_MS") {
        config.health.interval_ms = v.max(1);
    }
    if let Some(v) = parsed::<u32>(env, "LOKAL_HEALTH_FAILURE_THRESHOLD") {
        config.health.failure_threshold = v.max(1);
    }
    if let Some(v) = parsed::<u64>(env, "LOKAL_HEALTH_CHECK_TIMEOUT_MS") {
        config.health.check_timeout_ms = v.max(1);
    }

    if let Some(v) = parsed::<usize>(env, "LOKAL_FALLBACK_CACHE_CAPACITY") {
        config.fallback_cache.capacity = v.max(1);
    }
    if let Some(v) = parsed::<u64>(env, "LOKAL_FALLBACK_CACHE_SWEEP_MS") {
        config.fallback_cache.sweep_interval_ms = v.max(1);
    }
    if let Some(v) = parsed::<u64>(env, "LOKAL_FALLBACK_CACHE_BACKFILL_TTL_MS") {
        config.fallback_cache.backfill_ttl_ms = v;
    }
}
