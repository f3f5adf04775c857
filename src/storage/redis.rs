//! Redis cache store.
//!
//! # Connection Management
//!
//! Holds one multiplexed `redis::aio::ConnectionManager`, created lazily on
//! first use and cloned per command. Driver-level retries are disabled; the
//! circuit breaker in front of this store owns backoff.
//!
//! # Command Timeout
//!
//! Every command is bounded by the configured command timeout so an
//! unresponsive server surfaces as [`Error::Timeout`].

use crate::config::CacheConfig;
use crate::storage::traits::CacheStore;
use crate::{Error, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, FromRedisValue};
use secrecy::ExposeSecret;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Redis-backed [`CacheStore`].
pub struct RedisStore {
    client: Client,
    key_prefix: Option<String>,
    command_timeout: Duration,
    connection: Mutex<Option<ConnectionManager>>,
    closed: AtomicBool,
}

fn redis_error(operation: &str, e: impl std::fmt::Display) -> Error {
    Error::OperationFailed {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

impl RedisStore {
    /// Creates the client. No connection is opened until first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no URL is configured or it does
    /// not parse.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| Error::Configuration("cache.url is not set".to_string()))?;
        let client = Client::open(url.expose_secret())
            .map_err(|e| Error::Configuration(format!("invalid cache url: {e}")))?;

        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone(),
            command_timeout: config.command_timeout(),
            connection: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }

    /// Returns a handle to the shared connection, connecting if needed.
    async fn get_connection(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DependencyUnavailable {
                dependency: "redis".to_string(),
                reason: "client closed".to_string(),
            });
        }

        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let config = ConnectionManagerConfig::new().set_number_of_retries(0);
        let conn = self
            .bounded(
                "redis_connect",
                self.client.get_connection_manager_with_config(config),
            )
            .await?
            .map_err(|e| redis_error("redis_connect", e))?;
        tracing::debug!("Redis connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.command_timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                operation: operation.to_string(),
                timeout_ms: u64::try_from(self.command_timeout.as_millis()).unwrap_or(u64::MAX),
            })
    }

    async fn run<T: FromRedisValue>(&self, operation: &str, cmd: redis::Cmd) -> Result<T> {
        let mut conn = self.get_connection().await?;
        self.bounded(operation, cmd.query_async::<T>(&mut conn))
            .await?
            .map_err(|e| redis_error(operation, e))
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.key(key));
        self.run("redis_get", cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(Error::InvalidInput("cache ttl must be > 0".to_string()));
        }
        let seconds = ttl.as_millis().div_ceil(1000);
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key))
            .arg(value)
            .arg("EX")
            .arg(u64::try_from(seconds).unwrap_or(u64::MAX));
        self.run::<()>("redis_set", cmd).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.key(key));
        let removed: u64 = self.run("redis_del", cmd).await?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let reply: String = self.run("redis_ping", redis::cmd("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(redis_error("redis_ping", format!("unexpected reply '{reply}'")))
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.connection.lock().await.take();
        tracing::debug!("Redis client closed");
    }
}
