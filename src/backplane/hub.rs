//! Backplane hub: a channel relay over WebSocket.
//!
//! Every peer (node) may subscribe to any number of channels. A `publish`
//! is relayed to every peer subscribed to its channel, the publisher
//! included. Frames from one peer are handled sequentially and appended to
//! each recipient's queue in that order, which gives per-origin FIFO. A
//! peer whose queue overflows is disconnected and is expected to reconnect.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::backplane::frame::HubFrame;
use crate::client::{CloseReason, OutboundQueue, OverflowPolicy, PushOutcome};
use crate::transport::websocket::{bind, write_loop};
use crate::utils::StartupError;

/// Per-peer queue bound on the hub side.
pub const DEFAULT_PEER_QUEUE_LIMIT: usize = 4096;

type PeerId = u64;

#[derive(Debug)]
pub struct Hub {
    queue_limit: usize,
    peers: DashMap<PeerId, Arc<OutboundQueue>>,
    channels: DashMap<String, HashSet<PeerId>>,
    next_peer: AtomicU64,
}

impl Hub {
    /// A relay with no peers
    /// Each peer gets an outbound queue of `queue_limit` frames and is
    /// disconnected when it overflows
    pub fn new(queue_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            queue_limit,
            peers: DashMap::new(),
            channels: DashMap::new(),
            next_peer: AtomicU64::new(1),
        })
    }

    /// Binds `addr` and serves until the returned handle is shut down.
    pub async fn spawn(addr: &str, queue_limit: usize) -> Result<HubHandle, StartupError> {
        let listener = bind(addr).await?;
        let local_addr = listener.local_addr().map_err(|source| StartupError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let hub = Hub::new(queue_limit);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(hub.clone().serve(listener, cancel.clone()));
        info!("backplane hub listening on ws://{}", local_addr);

        Ok(HubHandle {
            hub,
            local_addr,
            cancel,
            task,
        })
    }

    /// Accepts peers on `listener` until `cancel` fires, then closes every
    /// peer queue so their writers finish
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = cancel.cancelled() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(self.clone().handle_peer(stream, addr));
                }
                Err(e) => warn!("hub accept failed: {}", e),
            }
        }

        for peer in self.peers.iter() {
            peer.value().close(CloseReason::Shutdown);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|c| c.len()).unwrap_or(0)
    }

    async fn handle_peer(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("hub handshake with {} failed: {}", addr, e);
                return;
            }
        };

        let peer_id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(OutboundQueue::new(
            self.queue_limit,
            OverflowPolicy::Disconnect,
        ));
        self.peers.insert(peer_id, queue.clone());
        debug!(peer_id, %addr, "hub peer connected");

        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let label = format!("hub-peer-{peer_id}");
        let writer_queue = queue.clone();
        let mut writer =
            tokio::spawn(async move { write_loop(ws_sender, &writer_queue, &label).await });

        loop {
            let incoming = tokio::select! {
                incoming = ws_receiver.next() => incoming,
                _ = &mut writer => break,
            };
            match incoming {
                Some(Ok(WsMessage::Text(text))) => match HubFrame::parse(text.as_str()) {
                    Ok(frame) => self.handle_frame(peer_id, frame),
                    Err(e) => debug!(peer_id, "ignoring malformed hub frame: {}", e),
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(peer_id, "hub peer read failed: {}", e);
                    break;
                }
            }
        }

        self.remove_peer(peer_id);
        writer.abort();
        debug!(peer_id, "hub peer disconnected");
    }

    fn handle_frame(&self, peer_id: PeerId, frame: HubFrame) {
        match frame {
            HubFrame::Subscribe { channel } => {
                self.channels.entry(channel).or_default().insert(peer_id);
            }
            HubFrame::Unsubscribe { channel } => {
                if let Some(mut peers) = self.channels.get_mut(&channel) {
                    peers.remove(&peer_id);
                }
                self.channels.remove_if(&channel, |_, peers| peers.is_empty());
            }
            HubFrame::Publish { channel, data } => self.relay(channel, data),
            HubFrame::Message { .. } => {
                debug!(peer_id, "peers may not send message frames");
            }
        }
    }

    fn relay(&self, channel: String, data: String) {
        let recipients: Vec<PeerId> = match self.channels.get(&channel) {
            Some(peers) => peers.iter().copied().collect(),
            None => return,
        };

        let frame = match (HubFrame::Message { channel, data }).to_ws() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode hub frame: {}", e);
                return;
            }
        };

        let mut overflowed = Vec::new();
        for peer_id in recipients {
            let Some(queue) = self.peers.get(&peer_id).map(|q| q.value().clone()) else {
                continue;
            };
            if queue.push(frame.clone()) == PushOutcome::Disconnected {
                overflowed.push(peer_id);
            }
        }

        for peer_id in overflowed {
            warn!(peer_id, "hub peer queue overflowed, disconnecting");
            self.remove_peer(peer_id);
        }
    }

    fn remove_peer(&self, peer_id: PeerId) {
        if let Some((_, queue)) = self.peers.remove(&peer_id) {
            queue.close(CloseReason::PeerClosed);
        }
        for mut peers in self.channels.iter_mut() {
            peers.remove(&peer_id);
        }
        self.channels.retain(|_, peers| !peers.is_empty());
    }
}

/// A running hub.
#[derive(Debug)]
pub struct HubHandle {
    hub: Arc<Hub>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HubHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Stops accepting peers and closes every peer connection.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        info!("backplane hub on {} stopped", self.local_addr);
    }
}
