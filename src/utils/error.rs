//! Error types shared across the node.
//!
//! The taxonomy mirrors how failures are handled at runtime: everything
//! scoped to a single connection or to the backplane is recoverable and is
//! contained where it happens; only resource acquisition at startup is fatal.

use std::io;

use thiserror::Error;

use crate::broker::message::ConnectionId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The connection is not (or no longer) registered on this node.
    /// Callers treat this as "already disconnected".
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// The broadcast medium is unreachable. Cross-node fan-out is degraded
    /// until the adapter reconnects; local delivery is unaffected.
    #[error("backplane unavailable")]
    BackplaneUnavailable,

    /// A connection's outbound queue hit its bound.
    #[error("outbound queue overflow on connection {0}")]
    OutboundOverflow(ConnectionId),

    #[error("startup failure: {0}")]
    StartupFailure(#[from] StartupError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl Error {
    /// Only startup-time resource acquisition failures abort the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StartupFailure(_))
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid setting `{key}`: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("backplane at {url} unreachable within {grace_ms}ms")]
    BackplaneUnreachable { url: String, grace_ms: u64 },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}
