//! # Stickycast
//!
//! `stickycast` is a clustered WebSocket broadcast node. Clients hold
//! long-lived connections on whichever node the external router placed them;
//! a message published on any connection reaches every subscribed
//! connection on every node through a shared backplane, while routers keep
//! each client pinned to its node using the affinity contract.
//!
//! ## Core Modules
//!
//! - `broker`: envelopes and their codecs, the connection registry and the broadcast coordinator.
//! - `backplane`: the broadcast medium (in-memory or a WebSocket hub) and the adapter on top of it.
//! - `client`: one accepted connection and its bounded outbound queue.
//! - `presence`: health announcements and the routing-side liveness view.
//! - `affinity`: affinity tokens, the affinity cookie and reference routing rules.
//! - `transport`: the client protocol and the node's WebSocket server.
//! - `node`: the per-node context and lifecycle.
//! - `config`: configuration loading.
//! - `utils`: error types and logging.

pub mod affinity;
pub mod backplane;
pub mod broker;
pub mod client;
pub mod config;
pub mod node;
pub mod presence;
pub mod transport;
pub mod utils;

pub use node::{Node, NodeContext};

#[cfg(test)]
mod tests;
