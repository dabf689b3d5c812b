//! Presence/Liveness Reporter.
//!
//! Announces `{nodeId, health, connectionCount, timestamp}` on the presence
//! channel at a jittered interval. The first announce says `starting`; once
//! one announce has gone through the node reports `healthy`. `drain` flips
//! the state to `draining` and announces it at once. The signal is advisory:
//! nothing here refuses connections.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backplane::BackplaneAdapter;
use crate::broker::message::NodeId;
use crate::broker::registry::ConnectionRegistry;
use crate::presence::record::{HealthState, PresenceRecord};
use crate::utils::Result;

/// A delay drawn uniformly from `[interval / 2, 3 * interval / 2]`.
pub fn jittered(interval: Duration) -> Duration {
    let half = interval / 2;
    let spread = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    if spread == 0 {
        return interval;
    }
    half + Duration::from_millis(rand::rng().random_range(0..=spread))
}

#[derive(Debug)]
pub struct PresenceReporter {
    node_id: NodeId,
    address: Option<String>,
    interval: Duration,
    backplane: Arc<BackplaneAdapter>,
    registry: Arc<ConnectionRegistry>,
    state: watch::Sender<HealthState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceReporter {
    pub fn new(
        backplane: Arc<BackplaneAdapter>,
        registry: Arc<ConnectionRegistry>,
        interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(HealthState::Starting);
        Self {
            node_id: registry.node_id().to_string(),
            address: None,
            interval,
            backplane,
            registry,
            state,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn health(&self) -> HealthState {
        *self.state.borrow()
    }

    pub fn watch_health(&self) -> watch::Receiver<HealthState> {
        self.state.subscribe()
    }

    /// The record the next tick would publish.
    pub fn current_record(&self) -> PresenceRecord {
        let count = u32::try_from(self.registry.len()).unwrap_or(u32::MAX);
        let record = PresenceRecord::new(self.node_id.clone(), self.health(), count);
        match &self.address {
            Some(address) => record.with_address(address.clone()),
            None => record,
        }
    }

    /// Publishes the current record once. A successful announce while
    /// `starting` promotes the node to `healthy`.
    pub async fn announce(&self) -> Result<()> {
        self.backplane.announce(&self.current_record()).await?;

        let promoted = self.state.send_if_modified(|state| {
            if *state == HealthState::Starting {
                *state = HealthState::Healthy;
                true
            } else {
                false
            }
        });
        if promoted {
            info!(node_id = %self.node_id, "node is healthy");
            self.backplane.announce(&self.current_record()).await?;
        }
        Ok(())
    }

    /// Starts the periodic announce loop. Calling it twice is a no-op.
    pub fn spawn(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let reporter = self.clone();
        *task = Some(tokio::spawn(async move { reporter.run().await }));
    }

    async fn run(&self) {
        loop {
            if let Err(e) = self.announce().await {
                warn!(node_id = %self.node_id, "presence announce failed: {}", e);
            }
            let delay = jittered(self.interval);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => break,
            }
        }
        debug!(node_id = %self.node_id, "presence reporter stopped");
    }

    /// Marks the node `draining` and announces it immediately.
    pub async fn drain(&self) -> Result<()> {
        self.state.send_replace(HealthState::Draining);
        info!(node_id = %self.node_id, "node is draining");
        self.backplane.announce(&self.current_record()).await
    }

    /// Ends the announce loop and waits for it
    /// No further records are published, so peers see this node go silent
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
