//! Connection registry
//!
//! Per-node index of attached connections and their topic subscriptions.
//! Both maps are sharded (`DashMap`), so registrations, subscriptions and
//! deliveries from many connection tasks only contend when they hash to the
//! same shard. No shard lock is ever held while another map is touched, and
//! none is held while a delivery callback runs.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::broker::message::{ConnectionId, NodeId};
use crate::broker::topic::Topic;
use crate::client::{CloseReason, Connection};
use crate::utils::{Error, Result};

/// Index of the connections attached to one node
/// Maps connection IDs to their shared [`Connection`] entry and topic names to
/// the IDs subscribed to them
/// The two maps are kept consistent by every mutating method below
#[derive(Debug)]
pub struct ConnectionRegistry {
    node_id: NodeId,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    topics: DashMap<String, Topic>,
    default_topic: Option<String>,
}

impl ConnectionRegistry {
    /// Creates an empty registry for the node `node_id`
    /// No default topic is set; see [`with_default_topic`](Self::with_default_topic)
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            connections: DashMap::new(),
            topics: DashMap::new(),
            default_topic: None,
        }
    }

    /// Every connection registered afterwards is subscribed to `topic`.
    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = Some(topic.into());
        self
    }

    /// The node this registry belongs to
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The topic every new connection joins on register, if any
    pub fn default_topic(&self) -> Option<&str> {
        self.default_topic.as_deref()
    }

    /// Adds a connection and returns the shared registry entry.
    ///
    /// A connection already registered under the same ID is closed and
    /// replaced.
    pub fn register(&self, connection: Connection) -> Arc<Connection> {
        let entry = Arc::new(connection);
        let id = entry.id.clone();

        if let Some(previous) = self.connections.insert(id.clone(), entry.clone()) {
            debug!(conn_id = %id, "replacing connection registered under the same id");
            previous.close(CloseReason::PeerClosed);
            self.detach_topics(&previous);
        }

        if let Some(topic) = self.default_topic.clone() {
            // Cannot fail: the entry was inserted above.
            let _ = self.subscribe(&id, &topic);
        }

        debug!(conn_id = %id, node_id = %self.node_id, "connection registered");
        entry
    }

    /// Removes a connection and all of its subscriptions, closing its
    /// outbound queue.
    pub fn unregister(&self, id: &str) -> Result<Arc<Connection>> {
        let (_, connection) = self
            .connections
            .remove(id)
            .ok_or_else(|| Error::ConnectionNotFound(id.to_string()))?;

        connection.close(CloseReason::PeerClosed);
        self.detach_topics(&connection);
        debug!(conn_id = %id, "connection unregistered");
        Ok(connection)
    }

    /// Subscribes connection `id` to `topic`, creating the topic on first use
    /// Subscribing twice is a no-op
    /// Fails with `ConnectionNotFound` if `id` is not registered, including when
    /// it is unregistered while this call is running
    pub fn subscribe(&self, id: &str, topic: &str) -> Result<()> {
        let connection = self.get(id).ok_or_else(|| not_found(id))?;

        connection.add_topic(topic);
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .subscribe(id.to_string());

        // An unregister may have run between the lookup and the insert; if so
        // undo the insert so no dangling subscriber is left behind.
        if !self.connections.contains_key(id) {
            self.remove_subscriber(topic, id);
            return Err(not_found(id));
        }
        Ok(())
    }

    /// Removes connection `id` from `topic`
    /// Unsubscribing from a topic the connection never joined succeeds
    /// An emptied topic is dropped from the index
    /// Fails with `ConnectionNotFound` if `id` is not registered
    pub fn unsubscribe(&self, id: &str, topic: &str) -> Result<()> {
        let connection = self.get(id).ok_or_else(|| not_found(id))?;
        connection.remove_topic(topic);
        self.remove_subscriber(topic, id);
        Ok(())
    }

    /// Invokes `f` for every connection currently subscribed to `topic` and
    /// returns how many were visited.
    ///
    /// The subscriber set is copied first and each connection is resolved
    /// individually. A connection unregistered concurrently is either
    /// resolved (and then visited in full, since `f` holds its own `Arc`) or
    /// skipped entirely.
    pub fn for_each_subscriber<F>(&self, topic: &str, mut f: F) -> usize
    where
        F: FnMut(&Arc<Connection>),
    {
        let ids = match self.topics.get(topic) {
            Some(topic) => topic.snapshot(),
            None => return 0,
        };

        let mut visited = 0;
        for id in ids {
            let Some(connection) = self.get(&id) else {
                continue;
            };
            f(&connection);
            visited += 1;
        }
        visited
    }

    /// Looks up a registered connection by ID
    /// The returned `Arc` stays usable after the connection is unregistered,
    /// but its outbound queue will be closed by then
    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Whether `id` is currently registered
    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of registered connections, as reported in presence records
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections subscribed to `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|t| t.len()).unwrap_or(0)
    }

    /// Names of every topic with at least one subscriber
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.key().clone()).collect()
    }

    /// Snapshot of every registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    /// Closes every connection with `reason` without unregistering them, so
    /// writer tasks can still flush what was queued.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let connections = self.connections();
        for connection in &connections {
            connection.close(reason);
        }
        connections.len()
    }

    fn detach_topics(&self, connection: &Connection) {
        for topic in connection.take_topics() {
            self.remove_subscriber(&topic, &connection.id);
        }
    }

    fn remove_subscriber(&self, topic: &str, id: &str) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.unsubscribe(id);
        }
        self.topics.remove_if(topic, |_, t| t.is_empty());
    }
}

fn not_found(id: &str) -> Error {
    Error::ConnectionNotFound(id.to_string())
}
