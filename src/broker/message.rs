//! Message envelope
//!
//! `Envelope` is the unit exchanged both with clients and over the
//! backplane. Its fields are fixed at creation: relaying nodes only read
//! them, which is why they are private and exposed through accessors.
//!
//! - `origin_node`: node that created the envelope
//! - `origin_connection`: connection on that node, `None` for node-authored messages
//! - `topic`: routing key matched against local subscriptions
//! - `payload`: opaque bytes
//! - `sequence`: per-origin-node, strictly increasing
//! - `timestamp`: milliseconds since UNIX epoch at the origin

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub type NodeId = String;
pub type ConnectionId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    origin_node: NodeId,
    origin_connection: Option<ConnectionId>,
    topic: String,
    #[serde(with = "crate::broker::codec::base64_payload")]
    payload: Bytes,
    sequence: u64,
    timestamp: u64,
}

impl Envelope {
    /// Stamps a new envelope with the current wall-clock time.
    pub fn new(
        origin_node: impl Into<NodeId>,
        origin_connection: Option<ConnectionId>,
        topic: impl Into<String>,
        payload: Bytes,
        sequence: u64,
    ) -> Self {
        Self::from_parts(
            origin_node,
            origin_connection,
            topic,
            payload,
            sequence,
            now_millis(),
        )
    }

    pub fn from_parts(
        origin_node: impl Into<NodeId>,
        origin_connection: Option<ConnectionId>,
        topic: impl Into<String>,
        payload: Bytes,
        sequence: u64,
        timestamp: u64,
    ) -> Self {
        Self {
            origin_node: origin_node.into(),
            origin_connection,
            topic: topic.into(),
            payload,
            sequence,
            timestamp,
        }
    }

    pub fn origin_node(&self) -> &str {
        &self.origin_node
    }

    pub fn origin_connection(&self) -> Option<&str> {
        self.origin_connection.as_deref()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

pub(crate) fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}
