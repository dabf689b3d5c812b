//! Bounded per-connection outbound queue.
//!
//! Deliveries never wait on a slow consumer: `push` is synchronous and
//! resolves overflow immediately according to the configured
//! [`OverflowPolicy`]. The connection's writer task is the only consumer.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tungstenite::protocol::Message as WsMessage;

/// What happens when a connection's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Close the connection; queued messages are discarded.
    Disconnect,
    /// Evict the oldest queued message to make room.
    DropOldest,
    /// Discard the incoming message.
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "drop_newest" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!(
                "unknown overflow policy `{other}` (expected disconnect, drop_oldest or drop_newest)"
            )),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OverflowPolicy::Disconnect => "disconnect",
            OverflowPolicy::DropOldest => "drop_oldest",
            OverflowPolicy::DropNewest => "drop_newest",
        };
        f.write_str(name)
    }
}

/// Result of a single [`OutboundQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest message.
    DroppedOldest,
    /// The new message was discarded.
    DroppedNewest,
    /// The queue overflowed and is now closed.
    Disconnected,
    /// The queue was already closed; nothing was queued.
    Closed,
}

impl PushOutcome {
    pub fn is_delivered(self) -> bool {
        matches!(self, PushOutcome::Queued | PushOutcome::DroppedOldest)
    }
}

/// Why a queue stopped accepting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Overflow under [`OverflowPolicy::Disconnect`].
    Overflow,
    /// The peer went away.
    PeerClosed,
    /// The node is shutting down; already queued messages still flush.
    Shutdown,
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<WsMessage>,
    closed: Option<CloseReason>,
}

#[derive(Debug)]
pub struct OutboundQueue {
    limit: usize,
    policy: OverflowPolicy,
    state: Mutex<QueueState>,
    notify: Notify,
    drained: Notify,
}

impl OutboundQueue {
    pub fn new(limit: usize, policy: OverflowPolicy) -> Self {
        Self {
            limit: limit.max(1),
            policy,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: None,
            }),
            notify: Notify::new(),
            drained: Notify::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Queues `msg` without waiting
    /// When the queue is full the overflow policy decides the outcome; under
    /// `Disconnect` the queue closes and its contents are discarded
    pub fn push(&self, msg: WsMessage) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return PushOutcome::Closed;
            }
            if state.items.len() < self.limit {
                state.items.push_back(msg);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(msg);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => return PushOutcome::DroppedNewest,
                    OverflowPolicy::Disconnect => {
                        state.items.clear();
                        state.closed = Some(CloseReason::Overflow);
                        self.drained.notify_waiters();
                        PushOutcome::Disconnected
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Waits for the next message. Returns `None` once the queue is closed
    /// and nothing is left to flush.
    pub async fn pop(&self) -> Option<WsMessage> {
        loop {
            if let Some(next) = self.poll() {
                return next;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<WsMessage> {
        self.poll().flatten()
    }

    fn poll(&self) -> Option<Option<WsMessage>> {
        let mut state = self.state.lock();
        if let Some(msg) = state.items.pop_front() {
            if state.items.is_empty() {
                self.drained.notify_waiters();
            }
            return Some(Some(msg));
        }
        state.closed.map(|_| None)
    }

    /// Stops accepting messages. The first reason wins. Anything already
    /// queued is discarded unless the reason is [`CloseReason::Shutdown`].
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
                if reason != CloseReason::Shutdown {
                    state.items.clear();
                    self.drained.notify_waiters();
                }
            }
        }
        self.notify.notify_one();
    }

    /// Resolves once nothing is left queued: the writer has taken every
    /// message, or a close discarded them.
    pub async fn flushed(&self) {
        loop {
            let drained = self.drained.notified();
            if self.is_empty() {
                return;
            }
            drained.await;
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().closed
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
