//! Connection representation
//!
//! A `Connection` is one accepted duplex session owned by the registry of
//! the node that accepted it. The transport holds the consuming side of the
//! outbound queue; everything else pushes into it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::affinity::AffinityToken;
use crate::broker::message::{ConnectionId, NodeId};
use crate::client::outbound::{CloseReason, OutboundQueue, PushOutcome};

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub node_id: NodeId,
    pub created_at: DateTime<Utc>,
    /// Router-supplied token, kept exactly as presented.
    pub affinity: Option<AffinityToken>,
    topics: Mutex<HashSet<String>>,
    outbound: OutboundQueue,
    /// Highest own-node sequence delivered on the local path.
    seen_local: AtomicU64,
}

impl Connection {
    /// Create a connection with a fresh UUID identifier.
    pub fn new(node_id: impl Into<NodeId>, outbound: OutboundQueue) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), node_id, outbound)
    }

    /// Create a connection under a caller-chosen ID
    /// Registering it replaces any connection already using that ID
    pub fn with_id(
        id: impl Into<ConnectionId>,
        node_id: impl Into<NodeId>,
        outbound: OutboundQueue,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            created_at: Utc::now(),
            affinity: None,
            topics: Mutex::new(HashSet::new()),
            outbound,
            seen_local: AtomicU64::new(0),
        }
    }

    /// Attach the router-supplied affinity token, if the handshake had one
    /// The token is kept as received and never reassigned
    pub fn with_affinity(mut self, token: Option<AffinityToken>) -> Self {
        self.affinity = token;
        self
    }

    /// Enqueue a frame for this client without waiting.
    pub fn send(&self, msg: WsMessage) -> PushOutcome {
        self.outbound.push(msg)
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Stop accepting frames; see [`OutboundQueue::close`]
    pub fn close(&self, reason: CloseReason) {
        self.outbound.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Snapshot of the subscribed topic names.
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().iter().cloned().collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().contains(topic)
    }

    pub(crate) fn add_topic(&self, topic: &str) -> bool {
        self.topics.lock().insert(topic.to_string())
    }

    pub(crate) fn remove_topic(&self, topic: &str) -> bool {
        self.topics.lock().remove(topic)
    }

    pub(crate) fn take_topics(&self) -> Vec<String> {
        self.topics.lock().drain().collect()
    }

    pub(crate) fn mark_seen_local(&self, sequence: u64) {
        self.seen_local.fetch_max(sequence, Ordering::AcqRel);
    }

    pub(crate) fn has_seen_local(&self, sequence: u64) -> bool {
        self.seen_local.load(Ordering::Acquire) >= sequence
    }
}
