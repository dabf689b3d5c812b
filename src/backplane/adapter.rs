//! Backplane Adapter
//!
//! Envelope-aware publish/subscribe on top of a [`Medium`]. All envelopes
//! travel on one well-known channel; topic filtering is left to the
//! coordinator. The adapter never suppresses a node's own envelopes.
//!
//! Presence records use a second channel through the same medium.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backplane::medium::{Medium, Subscription};
use crate::broker::codec;
use crate::broker::message::Envelope;
use crate::presence::record::PresenceRecord;
use crate::utils::Result;

/// Receives every envelope seen on the backplane channel.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn on_envelope(&self, envelope: Envelope);
}

/// Waits for room, which holds the pump back instead of buffering.
#[async_trait]
impl EnvelopeHandler for mpsc::Sender<Envelope> {
    async fn on_envelope(&self, envelope: Envelope) {
        let _ = self.send(envelope).await;
    }
}

#[derive(Debug, Clone)]
pub struct BackplaneAdapter {
    medium: Arc<dyn Medium>,
    channel: String,
    presence_channel: String,
}

impl BackplaneAdapter {
    pub fn new(
        medium: Arc<dyn Medium>,
        channel: impl Into<String>,
        presence_channel: impl Into<String>,
    ) -> Self {
        Self {
            medium,
            channel: channel.into(),
            presence_channel: presence_channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn medium(&self) -> &Arc<dyn Medium> {
        &self.medium
    }

    pub fn is_connected(&self) -> bool {
        self.medium.is_connected()
    }

    /// Hands the envelope to the medium. Returns once accepted; there is no
    /// acknowledgement from peers.
    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let frame = codec::encode(envelope)?;
        self.medium.publish(&self.channel, frame).await
    }

    /// Feeds every envelope from the backplane channel to `handler`, one at
    /// a time and in arrival order, until the returned handle is closed.
    pub async fn subscribe(&self, handler: Arc<dyn EnvelopeHandler>) -> Result<EnvelopeSubscription> {
        let subscription = self.medium.subscribe(&self.channel).await?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(subscription, handler, cancel.clone()));
        Ok(EnvelopeSubscription {
            medium: self.medium.clone(),
            channel: self.channel.clone(),
            cancel,
            task,
        })
    }

    pub async fn announce(&self, record: &PresenceRecord) -> Result<()> {
        let frame = record.encode()?;
        self.medium.publish(&self.presence_channel, frame).await
    }

    /// Raw presence frames; see [`PresenceTracker`](crate::presence::PresenceTracker).
    pub async fn presence_frames(&self) -> Result<Subscription> {
        self.medium.subscribe(&self.presence_channel).await
    }

    pub async fn close(&self) {
        self.medium.close().await;
    }
}

async fn pump(
    mut subscription: Subscription,
    handler: Arc<dyn EnvelopeHandler>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = subscription.recv() => frame,
            () = cancel.cancelled() => break,
        };
        let Some(frame) = frame else {
            debug!(channel = %subscription.channel(), "backplane subscription ended");
            break;
        };
        match codec::decode(&frame) {
            Ok(envelope) => handler.on_envelope(envelope).await,
            Err(e) => warn!("dropping malformed backplane frame: {}", e),
        }
    }
}

/// A live envelope subscription.
#[derive(Debug)]
pub struct EnvelopeSubscription {
    medium: Arc<dyn Medium>,
    channel: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EnvelopeSubscription {
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops delivery and leaves the channel.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        if let Err(e) = self.medium.unsubscribe(&self.channel).await {
            debug!("backplane unsubscribe failed: {}", e);
        }
    }
}
