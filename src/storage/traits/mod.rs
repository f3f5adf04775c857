//! Store traits.
//!
//! The connection manager talks to its dependencies only through these
//! traits, so tests can inject in-process doubles.

mod cache;
mod relational;

pub use cache::CacheStore;
pub use relational::{PoolStats, RelationalStore, Row};
