//! Node lifecycle.
//!
//! A [`NodeContext`] owns every per-node component and is handed to the
//! connection tasks explicitly, so several nodes can live in one process.
//! [`Node`] adds the running parts: listener, backplane attachment,
//! presence loop and liveness tracker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::affinity::AffinityCookie;
use crate::backplane::{BackplaneAdapter, Medium};
use crate::broker::message::NodeId;
use crate::broker::{ConnectionRegistry, Coordinator, DeliveryPolicy};
use crate::client::CloseReason;
use crate::config::Settings;
use crate::presence::{NodeView, PresenceReporter, PresenceTracker};
use crate::transport::websocket::{bind, serve};
use crate::utils::StartupError;

#[derive(Debug)]
pub struct NodeContext {
    pub settings: Settings,
    pub registry: Arc<ConnectionRegistry>,
    pub coordinator: Arc<Coordinator>,
    pub backplane: Arc<BackplaneAdapter>,
    pub presence: Arc<PresenceReporter>,
    pub tracker: Arc<PresenceTracker>,
    pub affinity_cookie: AffinityCookie,
}

impl NodeContext {
    /// Wires the components together. Nothing is started.
    pub fn new(settings: Settings, medium: Arc<dyn Medium>, address: Option<String>) -> Self {
        let registry = Arc::new(
            ConnectionRegistry::new(settings.node.id.clone())
                .with_default_topic(settings.delivery.default_topic.clone()),
        );
        let backplane = Arc::new(BackplaneAdapter::new(
            medium,
            settings.backplane.channel.clone(),
            settings.presence.channel.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            backplane.clone(),
            DeliveryPolicy::from(&settings.delivery),
            settings.delivery.default_topic.clone(),
        ));

        let reporter = PresenceReporter::new(
            backplane.clone(),
            registry.clone(),
            settings.presence_interval(),
        );
        let presence = Arc::new(match address {
            Some(address) => reporter.with_address(address),
            None => reporter,
        });
        let tracker = Arc::new(PresenceTracker::new(settings.liveness_timeout()));
        let affinity_cookie = AffinityCookie::new(
            settings.affinity.cookie_name.clone(),
            Duration::from_secs(settings.affinity.ttl_secs),
        );

        Self {
            settings,
            registry,
            coordinator,
            backplane,
            presence,
            tracker,
            affinity_cookie,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.settings.node.id
    }
}

#[derive(Debug)]
pub struct Node {
    ctx: Arc<NodeContext>,
    local_addr: SocketAddr,
    accept_cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    tracker_cancel: CancellationToken,
    tracker_task: JoinHandle<()>,
}

impl Node {
    /// Binds the listener and starts serving. Only the bind and the initial
    /// backplane attachment can fail.
    pub async fn start(settings: Settings, medium: Arc<dyn Medium>) -> Result<Self, StartupError> {
        let addr = settings.listen_addr();
        let listener = bind(&addr).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind { addr, source })?;

        let backplane_url = settings.backplane_url();
        let grace_ms = settings.backplane.startup_grace_ms;
        let unreachable = |e: crate::utils::Error| {
            warn!("backplane attach failed: {}", e);
            StartupError::BackplaneUnreachable {
                url: backplane_url.clone(),
                grace_ms,
            }
        };

        let ctx = Arc::new(NodeContext::new(
            settings,
            medium,
            Some(local_addr.to_string()),
        ));
        ctx.coordinator.attach().await.map_err(&unreachable)?;

        let tracker_cancel = CancellationToken::new();
        let frames = ctx.backplane.presence_frames().await.map_err(&unreachable)?;
        let tracker_task = ctx.tracker.spawn(frames, tracker_cancel.clone());

        ctx.presence.spawn();

        let accept_cancel = CancellationToken::new();
        let accept_task = tokio::spawn(serve(listener, ctx.clone(), accept_cancel.clone()));

        info!(node_id = %ctx.node_id(), "node started on {}", local_addr);
        Ok(Self {
            ctx,
            local_addr,
            accept_cancel,
            accept_task,
            tracker_cancel,
            tracker_task,
        })
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn node_id(&self) -> &str {
        self.ctx.node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Cluster view built from presence records, this node included.
    pub fn peers(&self) -> HashMap<NodeId, NodeView> {
        self.ctx.tracker.view()
    }

    /// Graceful stop: no new connections, `draining` announced, in-flight
    /// deliveries finished, queues given `DRAIN_TIMEOUT_MS` to flush, then
    /// the backplane subscription and every connection are closed.
    pub async fn shutdown(self) {
        let node_id = self.ctx.node_id().to_string();

        self.accept_cancel.cancel();
        let _ = self.accept_task.await;

        if let Err(e) = self.ctx.presence.drain().await {
            warn!(node_id = %node_id, "could not announce draining: {}", e);
        }

        self.ctx.coordinator.quiesce().await;

        let timeout = self.ctx.settings.drain_timeout();
        let flushed = tokio::time::timeout(timeout, wait_for_flush(&self.ctx.registry)).await;
        if flushed.is_err() {
            warn!(node_id = %node_id, "outbound queues not flushed within {:?}", timeout);
        }

        self.ctx.coordinator.detach().await;
        self.ctx.presence.stop().await;
        self.tracker_cancel.cancel();
        let _ = self.tracker_task.await;

        let closed = self.ctx.registry.close_all(CloseReason::Shutdown);
        self.ctx.backplane.close().await;
        info!(node_id = %node_id, connections = closed, "node drained");
    }
}

async fn wait_for_flush(registry: &ConnectionRegistry) {
    for conn in registry.connections() {
        conn.outbound().flushed().await;
    }
}
