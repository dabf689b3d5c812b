//! In-process medium.
//!
//! One [`MemoryBus`] stands in for the shared broker; each node attaches a
//! [`MemoryBackplane`] handle. Publishing fans out under the bus lock, so
//! every subscriber sees frames in one global order, which is stronger than
//! the per-origin FIFO the medium contract asks for.
//!
//! Each handle has its own connectivity switch. A disconnected handle
//! cannot publish and receives nothing, which lets tests partition a single
//! node and heal it later.
//!
//! A subscriber whose buffer is full misses the frame; the publisher is
//! never held up by it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::backplane::medium::{Medium, Subscription};
use crate::utils::{Error, Result};

#[derive(Debug)]
struct Subscriber {
    handle: u64,
    online: Arc<AtomicBool>,
    frames: mpsc::Sender<String>,
}

#[derive(Debug, Default)]
struct BusInner {
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_handle: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, connected handle onto this bus.
    pub fn attach(&self) -> MemoryBackplane {
        MemoryBackplane {
            handle: self.inner.next_handle.fetch_add(1, Ordering::Relaxed),
            bus: self.inner.clone(),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|subs| subs.iter().filter(|s| !s.frames.is_closed()).count())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryBackplane {
    handle: u64,
    bus: Arc<BusInner>,
    online: Arc<AtomicBool>,
}

impl MemoryBackplane {
    /// Flips this handle's link to the bus. Frames published while offline
    /// are never delivered to it, not even after it comes back.
    pub fn set_connected(&self, connected: bool) {
        self.online.store(connected, Ordering::SeqCst);
        debug!(handle = self.handle, connected, "memory backplane link changed");
    }
}

#[async_trait]
impl Medium for MemoryBackplane {
    async fn publish(&self, channel: &str, data: String) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::BackplaneUnavailable);
        }

        let mut channels = self.bus.channels.lock();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|s| !s.frames.is_closed());
            for subscriber in subscribers.iter() {
                if !subscriber.online.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(TrySendError::Full(_)) = subscriber.frames.try_send(data.clone()) {
                    warn!(
                        handle = subscriber.handle,
                        channel, "memory backplane subscriber is full, frame dropped"
                    );
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, subscription) = Subscription::bounded(channel);
        self.bus
            .channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                handle: self.handle,
                online: self.online.clone(),
                frames: tx,
            });
        Ok(subscription)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut channels = self.bus.channels.lock();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|s| s.handle != self.handle);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let mut channels = self.bus.channels.lock();
        for subscribers in channels.values_mut() {
            subscribers.retain(|s| s.handle != self.handle);
        }
        channels.retain(|_, subs| !subs.is_empty());
    }
}
