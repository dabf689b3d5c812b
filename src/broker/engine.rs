use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::backplane::{BackplaneAdapter, EnvelopeHandler, EnvelopeSubscription};
use crate::broker::codec;
use crate::broker::message::{ConnectionId, Envelope, NodeId};
use crate::broker::registry::ConnectionRegistry;
use crate::client::PushOutcome;
use crate::config::DeliverySettings;
use crate::utils::{Error, Result};

/// Switches that decide who receives an envelope on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Never echo a message back to the connection that sent it.
    pub exclude_origin: bool,
    /// Deliver own envelopes coming back from the backplane to local
    /// subscribers that have not seen them yet.
    pub redeliver_self: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            exclude_origin: true,
            redeliver_self: false,
        }
    }
}

impl From<&DeliverySettings> for DeliveryPolicy {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            exclude_origin: settings.exclude_origin,
            redeliver_self: settings.redeliver_self,
        }
    }
}

/// Delivery counters. Everything is `Relaxed`: the numbers are for
/// observation only.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    local_delivered: AtomicU64,
    remote_delivered: AtomicU64,
    stale_dropped: AtomicU64,
    overflow_dropped: AtomicU64,
    overflow_disconnects: AtomicU64,
    self_suppressed: AtomicU64,
    publish_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatsSnapshot {
    pub local_delivered: u64,
    pub remote_delivered: u64,
    pub stale_dropped: u64,
    pub overflow_dropped: u64,
    pub overflow_disconnects: u64,
    pub self_suppressed: u64,
    pub publish_failures: u64,
}

impl DeliveryStats {
    /// Copies every counter into a plain struct
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            local_delivered: self.local_delivered.load(Ordering::Relaxed),
            remote_delivered: self.remote_delivered.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            overflow_disconnects: self.overflow_disconnects.load(Ordering::Relaxed),
            self_suppressed: self.self_suppressed.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Outcome of a locally originated publish.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub envelope: Envelope,
    pub local_recipients: usize,
    /// `false` when the backplane refused the envelope; local delivery
    /// still happened.
    pub forwarded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Local,
    Remote,
    Redelivery,
}

/// Broadcast Coordinator
///
/// Decides which local connections receive an envelope and whether it goes
/// out on the backplane. Every envelope passes through `in_flight`, which
/// holds the last sequence number this node assigned: local deliveries and
/// backplane publishes therefore happen in the same order the sequence
/// numbers were handed out, and local subscribers see envelopes in arrival
/// order.
#[derive(Debug)]
pub struct Coordinator {
    node_id: NodeId,
    default_topic: String,
    registry: Arc<ConnectionRegistry>,
    backplane: Arc<BackplaneAdapter>,
    policy: DeliveryPolicy,
    in_flight: tokio::sync::Mutex<u64>,
    stats: DeliveryStats,
    subscription: tokio::sync::Mutex<Option<EnvelopeSubscription>>,
}

impl Coordinator {
    /// Creates a coordinator for the node that owns `registry`
    /// Envelopes published without a topic go to `default_topic`
    /// Nothing is received from the backplane until [`attach`](Self::attach)
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        backplane: Arc<BackplaneAdapter>,
        policy: DeliveryPolicy,
        default_topic: impl Into<String>,
    ) -> Self {
        Self {
            node_id: registry.node_id().to_string(),
            default_topic: default_topic.into(),
            registry,
            backplane,
            policy,
            in_flight: tokio::sync::Mutex::new(0),
            stats: DeliveryStats::default(),
            subscription: tokio::sync::Mutex::new(None),
        }
    }

    /// The origin node stamped on every envelope published here
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The delivery switches this coordinator was built with
    /// They are fixed for its lifetime
    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Point-in-time copy of the delivery counters
    /// Counters are read one by one, so a snapshot taken during traffic may
    /// mix values from slightly different moments
    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    /// The registry local deliveries are resolved against
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Starts consuming the backplane channel.
    ///
    /// Attaching again replaces the current subscription. The old one leaves
    /// the channel before the new one joins, since leaving drops every
    /// subscription this node's medium handle holds on it.
    pub async fn attach(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.subscription.lock().await;
        if let Some(previous) = slot.take() {
            previous.close().await;
        }
        let handler: Arc<dyn EnvelopeHandler> = self.clone();
        *slot = Some(self.backplane.subscribe(handler).await?);
        debug!(node_id = %self.node_id, "coordinator attached to backplane");
        Ok(())
    }

    /// Whether a backplane subscription is installed and still running.
    pub async fn is_attached(&self) -> bool {
        self.subscription
            .lock()
            .await
            .as_ref()
            .is_some_and(|subscription| subscription.is_active())
    }

    /// Stops consuming the backplane channel.
    pub async fn detach(&self) {
        let subscription = self.subscription.lock().await.take();
        if let Some(subscription) = subscription {
            subscription.close().await;
            debug!(node_id = %self.node_id, "coordinator detached from backplane");
        }
    }

    /// A message from a local connection. `topic` falls back to the
    /// default topic.
    pub async fn publish_from(
        &self,
        connection_id: &str,
        topic: Option<&str>,
        payload: Bytes,
    ) -> Result<PublishReport> {
        if !self.registry.contains(connection_id) {
            return Err(Error::ConnectionNotFound(connection_id.to_string()));
        }
        let topic = topic.unwrap_or(self.default_topic.as_str());
        self.originate(Some(connection_id.to_string()), topic, payload)
            .await
    }

    /// A message authored by the node itself.
    pub async fn publish_from_node(&self, topic: &str, payload: Bytes) -> Result<PublishReport> {
        self.originate(None, topic, payload).await
    }

    async fn originate(
        &self,
        origin_connection: Option<ConnectionId>,
        topic: &str,
        payload: Bytes,
    ) -> Result<PublishReport> {
        let mut last_sequence = self.in_flight.lock().await;
        *last_sequence += 1;
        let envelope = Envelope::new(
            self.node_id.clone(),
            origin_connection,
            topic,
            payload,
            *last_sequence,
        );

        let local_recipients = self.deliver(&envelope, Path::Local)?;

        // Registry access is over; only the ordering lock is still held.
        let forwarded = match self.backplane.publish(&envelope).await {
            Ok(()) => true,
            Err(e) => {
                bump(&self.stats.publish_failures);
                warn!(
                    topic = %envelope.topic(),
                    sequence = envelope.sequence(),
                    "cross-node fan-out skipped: {}", e
                );
                false
            }
        };
        drop(last_sequence);

        Ok(PublishReport {
            envelope,
            local_recipients,
            forwarded,
        })
    }

    /// An envelope from the backplane. Returns the number of local
    /// connections it was delivered to.
    pub async fn receive_remote(&self, envelope: Envelope) -> usize {
        let _ordering = self.in_flight.lock().await;

        let path = if envelope.origin_node() == self.node_id {
            if !self.policy.redeliver_self {
                return 0;
            }
            Path::Redelivery
        } else {
            Path::Remote
        };

        match self.deliver(&envelope, path) {
            Ok(count) => count,
            Err(e) => {
                warn!("cannot encode envelope for clients: {}", e);
                0
            }
        }
    }

    /// Waits until no envelope is being processed.
    pub async fn quiesce(&self) {
        drop(self.in_flight.lock().await);
    }

    fn deliver(&self, envelope: &Envelope, path: Path) -> Result<usize> {
        let frame = codec::encode_for_client(envelope)?;
        let own = envelope.origin_node() == self.node_id;
        let excluded = if own && self.policy.exclude_origin {
            envelope.origin_connection()
        } else {
            None
        };
        let sequence = envelope.sequence();

        let mut delivered = 0;
        let mut overflowed = Vec::new();
        self.registry.for_each_subscriber(envelope.topic(), |connection| {
            if excluded == Some(connection.id.as_str()) {
                bump(&self.stats.self_suppressed);
                return;
            }
            if own {
                if path == Path::Redelivery && connection.has_seen_local(sequence) {
                    return;
                }
                connection.mark_seen_local(sequence);
            }

            match connection.send(frame.clone()) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::DroppedOldest => {
                    delivered += 1;
                    bump(&self.stats.overflow_dropped);
                }
                PushOutcome::DroppedNewest => bump(&self.stats.overflow_dropped),
                PushOutcome::Disconnected => {
                    bump(&self.stats.overflow_disconnects);
                    overflowed.push(connection.id.clone());
                }
                PushOutcome::Closed => {
                    bump(&self.stats.stale_dropped);
                    debug!(conn_id = %connection.id, "dropping delivery to closed connection");
                }
            }
        });

        for id in overflowed {
            info!(
                conn_id = %id,
                "{}",
                Error::OutboundOverflow(id.clone())
            );
            // Already gone if its task noticed the close first.
            let _ = self.registry.unregister(&id);
        }

        let counter = match path {
            Path::Local => &self.stats.local_delivered,
            Path::Remote | Path::Redelivery => &self.stats.remote_delivered,
        };
        counter.fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }
}

#[async_trait]
impl EnvelopeHandler for Coordinator {
    async fn on_envelope(&self, envelope: Envelope) {
        self.receive_remote(envelope).await;
    }
}
