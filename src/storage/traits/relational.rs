//! Relational store trait.

use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// A result row keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Connection pool gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Maximum connections the pool may hold.
    pub max_size: usize,
    /// Connections currently open.
    pub size: usize,
    /// Connections checked out by callers.
    pub active: usize,
    /// Open connections waiting in the pool.
    pub idle: usize,
    /// Callers waiting for a connection.
    pub waiting: usize,
}

/// Trait for pooled relational database backends.
///
/// Parameters and rows are JSON values so callers stay independent of the
/// driver's type system.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Runs one statement and returns its rows.
    async fn query(&self, text: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Runs `statements` in order inside one transaction.
    ///
    /// Either every statement commits or none does.
    async fn transaction(&self, statements: &[(String, Vec<Value>)]) -> Result<Vec<Vec<Row>>>;

    /// Acquires a connection and runs a trivial statement.
    async fn ping(&self) -> Result<()>;

    /// Returns the current pool gauges.
    fn pool_stats(&self) -> PoolStats;

    /// Closes the pool. Later calls fail.
    async fn close(&self) {}
}
