//! The `transport` module is responsible for handling network communication
//! with clients, primarily via WebSockets.
//!
//! It defines the messaging protocol used between clients and the node,
//! and implements the node's WebSocket server: accepting connections,
//! capturing the router's affinity token at handshake, parsing client
//! frames and draining each connection's outbound queue to its socket.

pub mod message;
pub mod websocket;
