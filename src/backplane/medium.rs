//! Broadcast medium capability.
//!
//! A `Medium` moves opaque text frames between nodes on named channels. It
//! knows nothing about envelopes; the adapter layers those on top. Every
//! implementation must deliver frames from one publisher to each subscriber
//! in publish order, and must hand a publisher its own frames back when it
//! is subscribed to the channel.
//!
//! Subscriptions are bounded. A subscriber more than
//! [`SUBSCRIPTION_BUFFER`] frames behind misses the newest frames until it
//! catches up; the frames it does get stay in order.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::utils::Result;

/// Frames buffered per subscription before new ones are dropped.
pub const SUBSCRIPTION_BUFFER: usize = 4096;

/// Receiving side of one channel subscription.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    frames: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, frames: mpsc::Receiver<String>) -> Self {
        Self {
            channel: channel.into(),
            frames,
        }
    }

    /// A subscription together with the sender a medium feeds it through.
    pub fn bounded(channel: impl Into<String>) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (tx, Self::new(channel, rx))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next frame, or `None` once the medium has closed the subscription.
    pub async fn recv(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.frames.try_recv().ok()
    }
}

#[async_trait]
pub trait Medium: Send + Sync + fmt::Debug + 'static {
    /// Hands `data` to the medium for every subscriber of `channel`.
    ///
    /// Returns once the frame is accepted, not once it is delivered. Fails
    /// with `Error::BackplaneUnavailable` while disconnected or while the
    /// medium's own send buffer is full.
    async fn publish(&self, channel: &str, data: String) -> Result<()>;

    /// Starts receiving frames published on `channel`. The subscription
    /// survives reconnects of the underlying medium.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Stops delivery to every subscription of `channel` held by this handle.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Releases the medium. Open subscriptions end.
    async fn close(&self);
}
