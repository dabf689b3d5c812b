//! Topic management
//!
//! A `Topic` holds the IDs of the local connections subscribed to one topic
//! name. Duplicate subscriptions are a no-op. The registry keeps topics in a
//! sharded map, so each `Topic` is only ever touched under its shard lock.

use std::collections::HashSet;

use crate::broker::message::ConnectionId;

pub type SubscriberId = ConnectionId;

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashSet<SubscriberId>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Returns `true` if the subscriber was not already present.
    pub fn subscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.insert(id)
    }

    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subscribers.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subscribers.contains(id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Copy of the subscriber IDs, taken so callers can release the lock
    /// before doing any delivery work.
    pub fn snapshot(&self) -> Vec<SubscriberId> {
        self.subscribers.iter().cloned().collect()
    }
}
