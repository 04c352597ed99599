//! Routing-table storage.
//!
//! Provides the thread-safe routing table shared by dispatch and admin
//! handlers, and its persistence to the embedded key-value store.

mod persist;
mod route_store;

pub use persist::{ApiStore, FlushOnShutdown};
pub use route_store::RouteTable;
