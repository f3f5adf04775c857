//! Redis Integration Tests
//!
//! Tests the Redis cache store in isolation and behind the connection
//! manager, focusing on:
//! - GET / SET EX / DEL round trips with key prefixes
//! - TTL expiry on the server
//! - Graceful degradation when the server is unreachable
//!
//! Tests that need a live server require `LOKAL_TEST_REDIS_URL`:
//!
//! ```bash
//! export LOKAL_TEST_REDIS_URL="redis://localhost:6379"
//! cargo test --features redis redis_integration
//! ```

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::print_stderr
)]
#![cfg(feature = "redis")]

use lokal_resilience::storage::{CacheStore, RedisStore};
use lokal_resilience::{CacheConfig, ConnectionManager, DependencyState, ResilienceConfig};
use std::env;
use std::time::Duration;
use uuid::Uuid;

/// Environment variable for Redis test connection URL.
const REDIS_URL_ENV: &str = "LOKAL_TEST_REDIS_URL";

/// Returns the Redis connection URL if available, or None to skip tests.
fn get_redis_url() -> Option<String> {
    env::var(REDIS_URL_ENV).ok()
}

/// Macro to skip tests when Redis is not available.
macro_rules! require_redis {
    () => {
        match get_redis_url() {
            Some(url) => url,
            None => {
                eprintln!(
                    "Skipping test: {} not set. Set this environment variable to run Redis tests.",
                    REDIS_URL_ENV
                );
                return;
            },
        }
    };
}

fn store_config(url: &str) -> CacheConfig {
    CacheConfig {
        url: Some(url.to_string().into()),
        key_prefix: Some(format!("lokal_test_{}:", Uuid::new_v4().simple())),
        ..CacheConfig::default()
    }
}

// ============================================================================
// Store Tests
// ============================================================================

mod store {
    use super::*;

    #[tokio::test]
    async fn test_ping() {
        let url = require_redis!();
        let store = RedisStore::new(&store_config(&url)).unwrap();
        store.ping().await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let url = require_redis!();
        let store = RedisStore::new(&store_config(&url)).unwrap();

        assert_eq!(store.get("video:1").await.unwrap(), None);
        store
            .set("video:1", "{\"title\":\"pier\"}", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.get("video:1").await.unwrap().as_deref(),
            Some("{\"title\":\"pier\"}")
        );
        assert!(store.delete("video:1").await.unwrap());
        assert!(!store.delete("video:1").await.unwrap());
        assert_eq!(store.get("video:1").await.unwrap(), None);
        store.close().await;
    }

    #[tokio::test]
    async fn test_server_side_ttl_expires() {
        let url = require_redis!();
        let store = RedisStore::new(&store_config(&url)).unwrap();

        store.set("short", "v", Duration::from_millis(1)).await.unwrap();
        // Sub-second TTLs round up to one second.
        assert_eq!(store.get("short").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        store.close().await;
    }

    #[tokio::test]
    async fn test_prefixes_isolate_stores() {
        let url = require_redis!();
        let first = RedisStore::new(&store_config(&url)).unwrap();
        let second = RedisStore::new(&store_config(&url)).unwrap();

        first.set("shared", "first", Duration::from_secs(60)).await.unwrap();
        assert_eq!(second.get("shared").await.unwrap(), None);
        first.delete("shared").await.unwrap();
    }
}

// ============================================================================
// Connection Manager Tests
// ============================================================================

mod manager {
    use super::*;

    #[tokio::test]
    async fn test_manager_round_trip() {
        let url = require_redis!();
        let config = ResilienceConfig {
            cache: store_config(&url),
            ..ResilienceConfig::default()
        };
        let manager = ConnectionManager::new(config).unwrap();
        assert!(manager.initialize().await);
        assert_eq!(manager.connection_state().cache, DependencyState::Connected);

        assert!(manager.cache_set("k", "v", Duration::from_secs(30)).await);
        assert_eq!(manager.cache_get("k").await.as_deref(), Some("v"));
        assert!(manager.cache_delete("k").await);
        manager.shutdown().await;
    }

    /// Runs without a server: the port is closed, so every command fails fast.
    #[tokio::test]
    async fn test_unreachable_server_degrades_to_fallback() {
        let mut config = ResilienceConfig::default().with_cache_url("redis://127.0.0.1:1");
        config.cache.command_timeout_ms = 500;
        let manager = ConnectionManager::new(config).unwrap();

        assert!(manager.initialize().await);
        assert_eq!(manager.connection_state().cache, DependencyState::Error);

        assert!(manager.cache_set("k", "v", Duration::from_secs(30)).await);
        assert_eq!(manager.cache_get("k").await.as_deref(), Some("v"));
        assert_eq!(manager.get_connection_summary().fallback_cache.entries, 1);
        manager.shutdown().await;
    }
}
