//! Routing-side liveness view.
//!
//! Liveness is push-based: nodes announce themselves and a node whose last
//! record is older than the liveness timeout is reported `unreachable`,
//! whatever it last claimed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backplane::Subscription;
use crate::broker::message::NodeId;
use crate::presence::record::{HealthState, PresenceRecord};

#[derive(Debug, Clone)]
struct Seen {
    record: PresenceRecord,
    at: Instant,
}

/// Effective state of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub node_id: NodeId,
    pub health: HealthState,
    pub connection_count: u32,
    pub address: Option<String>,
}

#[derive(Debug)]
pub struct PresenceTracker {
    timeout: Duration,
    nodes: DashMap<NodeId, Seen>,
}

impl PresenceTracker {
    /// Creates an empty tracker
    /// A node that has not been heard from for `timeout` is reported as
    /// `unreachable` whatever its last record said
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            nodes: DashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn observe(&self, record: PresenceRecord) {
        self.observe_at(record, Instant::now());
    }

    /// Records `record` as received at `at`. Records older than the one
    /// already held for the node are ignored.
    pub fn observe_at(&self, record: PresenceRecord, at: Instant) {
        let mut entry = self
            .nodes
            .entry(record.node_id.clone())
            .or_insert_with(|| Seen {
                record: record.clone(),
                at,
            });
        if record.timestamp >= entry.record.timestamp {
            if entry.record.health != record.health {
                debug!(node_id = %record.node_id, health = %record.health, "node health changed");
            }
            entry.record = record;
            entry.at = at;
        }
    }

    /// Effective health of `node_id` right now
    /// Unknown nodes are `unreachable`
    pub fn health(&self, node_id: &str) -> HealthState {
        self.health_at(node_id, Instant::now())
    }

    pub fn health_at(&self, node_id: &str, now: Instant) -> HealthState {
        self.nodes
            .get(node_id)
            .map(|seen| self.effective(&seen, now))
            .unwrap_or(HealthState::Unreachable)
    }

    /// Every known node with its effective health and last reported load
    pub fn view(&self) -> HashMap<NodeId, NodeView> {
        self.view_at(Instant::now())
    }

    pub fn view_at(&self, now: Instant) -> HashMap<NodeId, NodeView> {
        self.nodes
            .iter()
            .map(|seen| {
                let view = NodeView {
                    node_id: seen.key().clone(),
                    health: self.effective(&seen, now),
                    connection_count: seen.record.connection_count,
                    address: seen.record.address.clone(),
                };
                (seen.key().clone(), view)
            })
            .collect()
    }

    /// Nodes that may receive new connections, by node id.
    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .view()
            .into_values()
            .filter(|view| view.health.accepts_new())
            .map(|view| view.node_id)
            .collect();
        nodes.sort();
        nodes
    }

    /// Drops everything known about `node_id`
    /// Returns whether the node was known
    pub fn forget(&self, node_id: &str) -> bool {
        self.nodes.remove(node_id).is_some()
    }

    /// Consumes presence frames until `cancel` fires or the subscription
    /// ends.
    pub fn spawn(
        self: &Arc<Self>,
        mut frames: Subscription,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = frames.recv() => frame,
                    () = cancel.cancelled() => break,
                };
                let Some(frame) = frame else { break };
                match PresenceRecord::decode(&frame) {
                    Ok(record) => tracker.observe(record),
                    Err(e) => debug!("ignoring malformed presence frame: {}", e),
                }
            }
            info!("presence tracker stopped");
        })
    }

    fn effective(&self, seen: &Seen, now: Instant) -> HealthState {
        if now.saturating_duration_since(seen.at) > self.timeout {
            HealthState::Unreachable
        } else {
            seen.record.health
        }
    }
}
