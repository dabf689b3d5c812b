//! Hub wire frames.
//!
//! Text frames, JSON, tagged by `type`:
//!
//! ```json
//! {"type":"subscribe","channel":"broadcast"}
//! {"type":"publish","channel":"broadcast","data":"..."}
//! {"type":"message","channel":"broadcast","data":"..."}
//! ```

use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;

use crate::utils::CodecError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, data: String },
    /// Hub to peer: a frame relayed from some publisher.
    Message { channel: String, data: String },
}

impl HubFrame {
    pub fn to_ws(&self) -> Result<WsMessage, CodecError> {
        Ok(WsMessage::text(serde_json::to_string(self)?))
    }

    pub fn parse(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }
}
