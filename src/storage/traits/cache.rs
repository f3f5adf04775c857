//! Cache store trait.

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Trait for remote key/value cache backends.
///
/// Values are opaque serialized payloads. Every method should return within
/// the backend's command timeout.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the value for `key`, or `None` on a miss.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Deletes `key`, returning true if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Checks that the backend answers.
    async fn ping(&self) -> Result<()>;

    /// Releases the client. Later calls fail.
    async fn close(&self) {}
}
