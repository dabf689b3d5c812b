//! The `broker` module decides who receives what on this node.
//!
//! It holds the message envelope and its codecs, the sharded connection
//! registry, and the broadcast coordinator that glues the registry to the
//! backplane.

pub mod codec;
pub mod engine;
pub mod message;
pub mod registry;
pub mod topic;

pub use engine::{Coordinator, DeliveryPolicy, DeliveryStatsSnapshot, PublishReport};
pub use message::Envelope;
pub use registry::ConnectionRegistry;
