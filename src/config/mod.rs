//! Configuration loading.
//!
//! Sources, lowest priority first: built-in defaults, an optional
//! `config/default.{toml,json,...}` file, then environment variables
//! (`BACKPLANE_HOST`, `NODE_LISTEN_PORT`, ...). Keys are flat; the file uses
//! the lowercase spelling of the environment names.

mod settings;

use config::{Config, Environment, File};

use crate::client::OverflowPolicy;
use crate::utils::StartupError;

pub use settings::{
    AffinitySettings, BackplaneSettings, DeliverySettings, NodeSettings, PartialSettings,
    PresenceSettings, Settings,
};

/// Loads configuration from `config/default` and the environment, merged
/// over [`Settings::default`] and validated.
pub fn load_config() -> Result<Settings, StartupError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().try_parsing(true));

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = merge(partial)?;
    settings.validate()?;
    Ok(settings)
}

/// Fills every unset key from the defaults.
pub fn merge(partial: PartialSettings) -> Result<Settings, StartupError> {
    let default = Settings::default();

    let interval_ms = partial
        .presence_interval_ms
        .unwrap_or(default.presence.interval_ms);

    let overflow_policy = match partial.overflow_policy.as_deref() {
        Some(raw) => raw
            .parse::<OverflowPolicy>()
            .map_err(|reason| StartupError::InvalidSetting {
                key: "OVERFLOW_POLICY",
                reason,
            })?,
        None => default.delivery.overflow_policy,
    };

    Ok(Settings {
        node: NodeSettings {
            id: partial.node_id.unwrap_or(default.node.id),
            listen_host: partial
                .node_listen_host
                .unwrap_or(default.node.listen_host),
            listen_port: partial
                .node_listen_port
                .unwrap_or(default.node.listen_port),
            drain_timeout_ms: partial
                .drain_timeout_ms
                .unwrap_or(default.node.drain_timeout_ms),
        },
        backplane: BackplaneSettings {
            host: partial.backplane_host.unwrap_or(default.backplane.host),
            port: partial.backplane_port.unwrap_or(default.backplane.port),
            channel: partial
                .backplane_channel
                .unwrap_or(default.backplane.channel),
            reconnect_backoff_base_ms: partial
                .reconnect_backoff_base_ms
                .unwrap_or(default.backplane.reconnect_backoff_base_ms),
            reconnect_backoff_max_ms: partial
                .reconnect_backoff_max_ms
                .unwrap_or(default.backplane.reconnect_backoff_max_ms),
            startup_grace_ms: partial
                .startup_grace_ms
                .unwrap_or(default.backplane.startup_grace_ms),
        },
        presence: PresenceSettings {
            channel: partial
                .presence_channel
                .unwrap_or(default.presence.channel),
            interval_ms,
            liveness_timeout_ms: partial
                .liveness_timeout_ms
                .unwrap_or(interval_ms.saturating_mul(3)),
        },
        delivery: DeliverySettings {
            outbound_queue_limit: partial
                .outbound_queue_limit
                .unwrap_or(default.delivery.outbound_queue_limit),
            overflow_policy,
            exclude_origin: partial
                .exclude_origin
                .unwrap_or(default.delivery.exclude_origin),
            redeliver_self: partial
                .redeliver_self
                .unwrap_or(default.delivery.redeliver_self),
            default_topic: partial
                .default_topic
                .unwrap_or(default.delivery.default_topic),
        },
        affinity: AffinitySettings {
            cookie_name: partial
                .affinity_cookie_name
                .unwrap_or(default.affinity.cookie_name),
            ttl_secs: partial
                .affinity_ttl_secs
                .unwrap_or(default.affinity.ttl_secs),
        },
        log_level: partial.log_level.unwrap_or(default.log_level),
    })
}

impl Settings {
    /// Rejects values that would make the node misbehave at runtime.
    pub fn validate(&self) -> Result<(), StartupError> {
        fn invalid(key: &'static str, reason: &str) -> Result<(), StartupError> {
            Err(StartupError::InvalidSetting {
                key,
                reason: reason.to_string(),
            })
        }

        if self.node.id.trim().is_empty() {
            return invalid("NODE_ID", "must not be empty");
        }
        if self.presence.interval_ms == 0 {
            return invalid("PRESENCE_INTERVAL_MS", "must be positive");
        }
        if self.presence.liveness_timeout_ms < self.presence.interval_ms {
            return invalid("LIVENESS_TIMEOUT_MS", "must be at least the presence interval");
        }
        if self.delivery.outbound_queue_limit == 0 {
            return invalid("OUTBOUND_QUEUE_LIMIT", "must be positive");
        }
        if self.backplane.reconnect_backoff_base_ms == 0 {
            return invalid("RECONNECT_BACKOFF_BASE_MS", "must be positive");
        }
        if self.backplane.reconnect_backoff_max_ms < self.backplane.reconnect_backoff_base_ms {
            return invalid(
                "RECONNECT_BACKOFF_MAX_MS",
                "must not be below RECONNECT_BACKOFF_BASE_MS",
            );
        }
        if self.backplane.channel == self.presence.channel {
            return invalid("PRESENCE_CHANNEL", "must differ from BACKPLANE_CHANNEL");
        }
        if self.delivery.default_topic.is_empty() {
            return invalid("DEFAULT_TOPIC", "must not be empty");
        }
        Ok(())
    }
}
