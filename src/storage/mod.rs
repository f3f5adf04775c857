//! Storage layer.
//!
//! - **Traits**: [`RelationalStore`] and [`CacheStore`], the seams the
//!   connection manager is built on
//! - **Backends**: [`PostgresStore`] (feature `postgres`) and [`RedisStore`]
//!   (feature `redis`)
//! - **Fallback**: [`FallbackCache`], the in-process second cache tier

// Allow cast precision loss for gauge values where exact precision is not critical.
#![allow(clippy::cast_precision_loss)]
// Allow significant_drop_tightening - dropping database connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]

mod fallback;
pub mod traits;

#[cfg(feature = "postgres")]
mod postgresql;
#[cfg(feature = "redis")]
mod redis;

pub use fallback::{FallbackCache, FallbackCacheStats};
#[cfg(feature = "postgres")]
pub use postgresql::PostgresStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use traits::{CacheStore, PoolStats, RelationalStore, Row};
