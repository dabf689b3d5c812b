//! Presence record
//!
//! One node's self-reported state at one tick. Only the latest record per
//! node matters; nothing here keeps history.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::broker::message::{NodeId, now_millis};
use crate::utils::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Starting,
    Healthy,
    /// About to shut down: keep existing sessions, assign no new ones.
    Draining,
    /// Never announced by a node itself; derived from missing heartbeats.
    Unreachable,
}

impl HealthState {
    /// May receive new connections.
    pub fn accepts_new(self) -> bool {
        matches!(self, HealthState::Healthy)
    }

    /// Existing sessions may keep routing here.
    pub fn keeps_sessions(self) -> bool {
        !matches!(self, HealthState::Unreachable)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthState::Starting => "starting",
            HealthState::Healthy => "healthy",
            HealthState::Draining => "draining",
            HealthState::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub node_id: NodeId,
    pub health: HealthState,
    pub connection_count: u32,
    pub timestamp: u64,
    /// Where the node accepts client connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl PresenceRecord {
    pub fn new(node_id: impl Into<NodeId>, health: HealthState, connection_count: u32) -> Self {
        Self {
            node_id: node_id.into(),
            health,
            connection_count,
            timestamp: now_millis(),
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(frame)?)
    }
}
