//! Data models shared across the resilience layer.

mod events;
mod state;

pub use events::{ConnectionEvent, EventMeta};
pub use state::{Component, ConnectionState, DependencyState};
