use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, Message as WsMessage};

use crate::affinity::{AffinityToken, token_from_request};
use crate::broker::codec::decode_payload;
use crate::client::{CloseReason, Connection, OutboundQueue};
use crate::node::NodeContext;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::StartupError;

/// Close reason sent to a client dropped for falling behind.
pub const OVERFLOW_CLOSE_REASON: &str = "outbound overflow";

pub async fn bind(addr: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Accepts client connections until `cancel` fires. Each connection runs in
/// its own task.
pub async fn serve(listener: TcpListener, ctx: Arc<NodeContext>, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(node_id = %ctx.node_id(), "WebSocket server listening on ws://{}", addr);
    }

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = cancel.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(stream, peer, ctx.clone(), cancel.clone()));
            }
            Err(e) => warn!("accept failed: {}", e),
        }
    }
    info!(node_id = %ctx.node_id(), "stopped accepting connections");
}

/// Runs one client session. A handshake that completes after `cancel` has
/// fired still gets a `welcome` and is then closed as shutting down.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<NodeContext>,
    cancel: CancellationToken,
) {
    let mut affinity = None;
    let cookie = &ctx.affinity_cookie;
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        affinity = token_from_request(request.headers(), cookie);
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, capture).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, "WebSocket handshake error: {}", e);
            return;
        }
    };

    let conn = admit(&ctx, affinity, &cancel);
    debug!(conn_id = %conn.id, %peer, "session started");

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let writer_conn = conn.clone();
    let mut writer = tokio::spawn(async move {
        write_loop(ws_sender, writer_conn.outbound(), &writer_conn.id).await
    });

    loop {
        let incoming = tokio::select! {
            incoming = ws_receiver.next() => incoming,
            _ = &mut writer => break,
        };
        match incoming {
            Some(Ok(WsMessage::Text(text))) => handle_text(&ctx, &conn, text.as_str()).await,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn_id = %conn.id, "read failed: {}", e);
                break;
            }
        }
    }

    // Already gone after an overflow.
    let _ = ctx.registry.unregister(&conn.id);
    info!(conn_id = %conn.id, "client disconnected");
}

/// Registers a new connection with its `welcome` already queued, so no
/// broadcast can reach the client ahead of it. If `cancel` has fired the
/// connection is closed and unregistered again before it is returned.
pub(crate) fn admit(
    ctx: &NodeContext,
    affinity: Option<AffinityToken>,
    cancel: &CancellationToken,
) -> Arc<Connection> {
    let delivery = &ctx.settings.delivery;
    let connection = Connection::new(
        ctx.node_id(),
        OutboundQueue::new(delivery.outbound_queue_limit, delivery.overflow_policy),
    )
    .with_affinity(affinity);

    let welcome = ServerMessage::Welcome {
        connection_id: connection.id.clone(),
        node_id: ctx.node_id().to_string(),
        affinity: connection.affinity.as_ref().map(|t| t.as_str().to_string()),
    };
    reply(&connection, &welcome);
    let conn = ctx.registry.register(connection);

    // Checked after registering: a shutdown that cancels later still finds
    // this connection in close_all.
    if cancel.is_cancelled() {
        conn.close(CloseReason::Shutdown);
        let _ = ctx.registry.unregister(&conn.id);
        info!(conn_id = %conn.id, "connection refused, node is shutting down");
    } else {
        info!(conn_id = %conn.id, affinity = ?conn.affinity, "client connected");
    }
    conn
}

pub(crate) async fn handle_text(ctx: &NodeContext, conn: &Arc<Connection>, text: &str) {
    let frame = match serde_json::from_str::<ClientMessage>(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(conn_id = %conn.id, "invalid client message: {}", e);
            reply(conn, &ServerMessage::error(format!("invalid message: {e}")));
            return;
        }
    };

    match frame {
        ClientMessage::Subscribe { topic } => match ctx.registry.subscribe(&conn.id, &topic) {
            Ok(()) => debug!(conn_id = %conn.id, topic = %topic, "subscribed"),
            Err(e) => reply(conn, &ServerMessage::error(e.to_string())),
        },
        ClientMessage::Unsubscribe { topic } => match ctx.registry.unsubscribe(&conn.id, &topic) {
            Ok(()) => debug!(conn_id = %conn.id, topic = %topic, "unsubscribed"),
            Err(e) => reply(conn, &ServerMessage::error(e.to_string())),
        },
        ClientMessage::Publish {
            topic,
            payload,
            encoding,
        } => {
            let payload = match decode_payload(&payload, encoding) {
                Ok(payload) => payload,
                Err(e) => {
                    reply(conn, &ServerMessage::error(e.to_string()));
                    return;
                }
            };
            match ctx
                .coordinator
                .publish_from(&conn.id, topic.as_deref(), payload)
                .await
            {
                Ok(report) => debug!(
                    conn_id = %conn.id,
                    topic = %report.envelope.topic(),
                    sequence = report.envelope.sequence(),
                    recipients = report.local_recipients,
                    "published"
                ),
                Err(e) => reply(conn, &ServerMessage::error(e.to_string())),
            }
        }
    }
}

fn reply(conn: &Connection, msg: &ServerMessage) {
    match msg.to_ws() {
        Ok(frame) => {
            conn.send(frame);
        }
        Err(e) => warn!(conn_id = %conn.id, "failed to encode reply: {}", e),
    }
}

/// Drains `queue` into `sink` until the queue closes, then ends the socket
/// with a close frame matching the reason.
pub(crate) async fn write_loop<S>(mut sink: S, queue: &OutboundQueue, label: &str)
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    while let Some(msg) = queue.pop().await {
        if let Err(e) = sink.send(msg).await {
            debug!(conn_id = %label, "send failed: {}", e);
            return;
        }
    }

    let frame = match queue.close_reason() {
        Some(CloseReason::Overflow) => Some(CloseFrame {
            code: CloseCode::Policy,
            reason: OVERFLOW_CLOSE_REASON.into(),
        }),
        Some(CloseReason::Shutdown) => Some(CloseFrame {
            code: CloseCode::Away,
            reason: "shutting down".into(),
        }),
        Some(CloseReason::PeerClosed) | None => None,
    };
    if let Some(frame) = frame {
        let _ = sink.send(WsMessage::Close(Some(frame))).await;
    }
    let _ = sink.close().await;
    debug!(conn_id = %label, "send loop closed");
}
