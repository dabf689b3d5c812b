//! The `client` module models one accepted client session on this node.
//!
//! It provides the `Connection` struct, which carries the connection's
//! identity, topic set and affinity token, plus the bounded outbound queue
//! the transport drains toward the socket.

pub mod outbound;
pub mod pubsub_client;

pub use outbound::{CloseReason, OutboundQueue, OverflowPolicy, PushOutcome};
pub use pubsub_client::Connection;
