//! Request routing and dispatch.
//!
//! Provides the pattern matcher for incoming paths, the upstream groups
//! with round-robin selection over available hosts, and the gateway
//! front-end that ties them to the HTTP listener.

pub mod gateway;
pub mod router;
pub mod upstream;

pub use gateway::Gateway;
