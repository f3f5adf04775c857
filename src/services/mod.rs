//! Connection services.
//!
//! [`ConnectionManager`] is the single entry point applications use to reach
//! the relational and cache stores. [`ConnectionSummary`] is its serializable
//! snapshot for health endpoints.

mod connection;
mod summary;

pub use connection::{
    CACHE_DEPENDENCY, ConnectionManager, ConnectionManagerBuilder, RELATIONAL_DEPENDENCY,
};
pub use summary::ConnectionSummary;
