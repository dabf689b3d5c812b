//! Networked medium: a reconnecting WebSocket client of the backplane hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::backplane::backoff::Backoff;
use crate::backplane::frame::HubFrame;
use crate::backplane::medium::{Medium, Subscription};
use crate::utils::{Error, Result, StartupError};

/// Frames a client may have queued for the hub before `publish` starts
/// failing. Matches the hub's per-peer bound.
pub const DEFAULT_OUTGOING_LIMIT: usize = 4096;

const CLOSE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct ClientInner {
    url: String,
    subscriptions: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    outgoing: mpsc::Sender<WsMessage>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl ClientInner {
    fn channels(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    fn dispatch(&self, text: &str) {
        match HubFrame::parse(text) {
            Ok(HubFrame::Message { channel, data }) => {
                let mut subscriptions = self.subscriptions.lock();
                if let Some(senders) = subscriptions.get_mut(&channel) {
                    senders.retain(|tx| match tx.try_send(data.clone()) {
                        Ok(()) => true,
                        Err(TrySendError::Full(_)) => {
                            warn!(channel = %channel, "backplane subscriber is full, frame dropped");
                            true
                        }
                        Err(TrySendError::Closed(_)) => false,
                    });
                }
            }
            Ok(other) => debug!("unexpected frame from hub: {:?}", other),
            Err(e) => warn!("malformed frame from hub: {}", e),
        }
    }

    /// Queues a frame without waiting. A full queue means the hub is not
    /// keeping up, which is reported as the backplane being unavailable.
    fn enqueue(&self, frame: HubFrame) -> Result<()> {
        let msg = frame.to_ws()?;
        self.outgoing.try_send(msg).map_err(|e| {
            if let TrySendError::Full(_) = e {
                warn!("backplane send queue to {} is full", self.url);
            }
            Error::BackplaneUnavailable
        })
    }

    /// Queues a control frame, waiting for room if needed.
    async fn enqueue_control(&self, frame: HubFrame) -> Result<()> {
        let msg = frame.to_ws()?;
        self.outgoing
            .send(msg)
            .await
            .map_err(|_| Error::BackplaneUnavailable)
    }
}

/// WebSocket client of a [`Hub`](crate::backplane::hub::Hub).
///
/// Channel subscriptions are remembered and re-sent on every reconnect.
/// Frames queued while the link is down are discarded when it comes back,
/// so nothing published during an outage is delivered late.
#[derive(Debug)]
pub struct HubClient {
    inner: Arc<ClientInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HubClient {
    /// Starts the connection task and waits up to `grace` for the first
    /// successful connect.
    pub async fn connect(
        url: impl Into<String>,
        backoff: Backoff,
        grace: Duration,
    ) -> std::result::Result<Self, StartupError> {
        let client = Self::spawn(url, backoff);
        let mut connected = client.inner.connected.subscribe();

        let reached = tokio::time::timeout(grace, connected.wait_for(|up| *up))
            .await
            .is_ok_and(|state| state.is_ok());
        if reached {
            return Ok(client);
        }

        let url = client.inner.url.clone();
        client.close().await;
        Err(StartupError::BackplaneUnreachable {
            url,
            grace_ms: u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Starts the connection task without waiting for it.
    pub fn spawn(url: impl Into<String>, backoff: Backoff) -> Self {
        Self::spawn_bounded(url, backoff, DEFAULT_OUTGOING_LIMIT)
    }

    /// Like [`spawn`](Self::spawn) with an explicit send queue bound.
    pub fn spawn_bounded(url: impl Into<String>, backoff: Backoff, outgoing_limit: usize) -> Self {
        let (outgoing, outgoing_rx) = mpsc::channel(outgoing_limit.max(1));
        let (connected, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            url: url.into(),
            subscriptions: Mutex::new(HashMap::new()),
            outgoing,
            connected,
            cancel: CancellationToken::new(),
        });

        let task = tokio::spawn(run(inner.clone(), outgoing_rx, backoff));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// The hub this client connects to
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Watch the link state.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }
}

#[async_trait]
impl Medium for HubClient {
    async fn publish(&self, channel: &str, data: String) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::BackplaneUnavailable);
        }
        self.inner.enqueue(HubFrame::Publish {
            channel: channel.to_string(),
            data,
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, subscription) = Subscription::bounded(channel);
        self.inner
            .subscriptions
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);

        // Re-sent on reconnect anyway; a failure here only means the task
        // has stopped.
        let _ = self
            .inner
            .enqueue_control(HubFrame::Subscribe {
                channel: channel.to_string(),
            })
            .await;
        Ok(subscription)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.inner.subscriptions.lock().remove(channel);
        let _ = self
            .inner
            .enqueue_control(HubFrame::Unsubscribe {
                channel: channel.to_string(),
            })
            .await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    async fn close(&self) {
        self.inner.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(
    inner: Arc<ClientInner>,
    mut outgoing: mpsc::Receiver<WsMessage>,
    mut backoff: Backoff,
) {
    loop {
        let attempt = tokio::select! {
            attempt = connect_async(inner.url.as_str()) => attempt,
            () = inner.cancel.cancelled() => break,
        };

        match attempt {
            Ok((ws_stream, _)) => {
                backoff.reset();
                let (mut ws_sender, mut ws_receiver) = ws_stream.split();

                // Anything queued before this link existed is stale.
                while outgoing.try_recv().is_ok() {}

                let mut resubscribed = true;
                for channel in inner.channels() {
                    let frame = match (HubFrame::Subscribe { channel }).to_ws() {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    if ws_sender.send(frame).await.is_err() {
                        resubscribed = false;
                        break;
                    }
                }

                if resubscribed {
                    inner.connected.send_replace(true);
                    info!("backplane connected to {}", inner.url);

                    loop {
                        tokio::select! {
                            out = outgoing.recv() => match out {
                                Some(msg) => {
                                    // A stalled hub must not keep close() waiting.
                                    let sent = tokio::select! {
                                        sent = ws_sender.send(msg) => sent,
                                        () = inner.cancel.cancelled() => break,
                                    };
                                    if let Err(e) = sent {
                                        debug!("backplane write failed: {}", e);
                                        break;
                                    }
                                }
                                None => break,
                            },
                            incoming = ws_receiver.next() => match incoming {
                                Some(Ok(WsMessage::Text(text))) => inner.dispatch(text.as_str()),
                                Some(Ok(WsMessage::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    debug!("backplane read failed: {}", e);
                                    break;
                                }
                            },
                            () = inner.cancel.cancelled() => {
                                let close = ws_sender.send(WsMessage::Close(None));
                                let _ = tokio::time::timeout(CLOSE_TIMEOUT, close).await;
                                break;
                            }
                        }
                    }

                    inner.connected.send_replace(false);
                    if inner.cancel.is_cancelled() {
                        break;
                    }
                    warn!("backplane connection to {} lost", inner.url);
                }
            }
            Err(e) => debug!("backplane connect to {} failed: {}", inner.url, e),
        }

        let delay = backoff.next_delay();
        debug!(
            attempt = backoff.attempts(),
            "reconnecting to backplane in {:?}", delay
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => continue,
            () = inner.cancel.cancelled() => break,
        }
    }

    inner.connected.send_replace(false);
    // Ends every open subscription.
    inner.subscriptions.lock().clear();
}
