use std::time::Duration;

use serde::Deserialize;

use crate::client::OverflowPolicy;

/// Top-level configuration for one node process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub node: NodeSettings,
    pub backplane: BackplaneSettings,
    pub presence: PresenceSettings,
    pub delivery: DeliverySettings,
    pub affinity: AffinitySettings,
    pub log_level: String,
}

/// Identity and listen address of this node.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub id: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub drain_timeout_ms: u64,
}

/// Where the backplane hub lives and how to keep reaching it.
#[derive(Debug, Clone)]
pub struct BackplaneSettings {
    pub host: String,
    pub port: u16,
    pub channel: String,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub startup_grace_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PresenceSettings {
    pub channel: String,
    pub interval_ms: u64,
    pub liveness_timeout_ms: u64,
}

/// Per-connection delivery behaviour.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub outbound_queue_limit: usize,
    pub overflow_policy: OverflowPolicy,
    pub exclude_origin: bool,
    pub redeliver_self: bool,
    pub default_topic: String,
}

#[derive(Debug, Clone)]
pub struct AffinitySettings {
    pub cookie_name: String,
    pub ttl_secs: u64,
}

/// Flat view of every recognised key. Each key is optional so that a file
/// or the environment may provide any subset; the rest comes from defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub node_id: Option<String>,
    pub node_listen_host: Option<String>,
    pub node_listen_port: Option<u16>,
    pub drain_timeout_ms: Option<u64>,
    pub backplane_host: Option<String>,
    pub backplane_port: Option<u16>,
    pub backplane_channel: Option<String>,
    pub reconnect_backoff_base_ms: Option<u64>,
    pub reconnect_backoff_max_ms: Option<u64>,
    pub startup_grace_ms: Option<u64>,
    pub presence_channel: Option<String>,
    pub presence_interval_ms: Option<u64>,
    pub liveness_timeout_ms: Option<u64>,
    pub outbound_queue_limit: Option<usize>,
    pub overflow_policy: Option<String>,
    pub exclude_origin: Option<bool>,
    pub redeliver_self: Option<bool>,
    pub default_topic: Option<String>,
    pub affinity_cookie_name: Option<String>,
    pub affinity_ttl_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl Settings {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.node.listen_host, self.node.listen_port)
    }

    pub fn backplane_url(&self) -> String {
        format!("ws://{}:{}", self.backplane.host, self.backplane.port)
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_millis(self.presence.interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.presence.liveness_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.node.drain_timeout_ms)
    }
}

/// Defaults suitable for a single node on localhost.
impl Default for Settings {
    fn default() -> Self {
        let interval_ms = 5_000;
        Self {
            node: NodeSettings {
                id: generate_node_id(),
                listen_host: "127.0.0.1".to_string(),
                listen_port: 8080,
                drain_timeout_ms: 5_000,
            },
            backplane: BackplaneSettings {
                host: "127.0.0.1".to_string(),
                port: 6380,
                channel: "broadcast".to_string(),
                reconnect_backoff_base_ms: 100,
                reconnect_backoff_max_ms: 10_000,
                startup_grace_ms: 5_000,
            },
            presence: PresenceSettings {
                channel: "presence".to_string(),
                interval_ms,
                liveness_timeout_ms: interval_ms * 3,
            },
            delivery: DeliverySettings {
                outbound_queue_limit: 256,
                overflow_policy: OverflowPolicy::Disconnect,
                exclude_origin: true,
                redeliver_self: false,
                default_topic: "broadcast".to_string(),
            },
            affinity: AffinitySettings {
                cookie_name: "node_affinity".to_string(),
                ttl_secs: 3_600,
            },
            log_level: "info".to_string(),
        }
    }
}

fn generate_node_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("node-{}", &id[..8])
}
