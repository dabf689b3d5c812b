use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::codec::{Delivery, PayloadEncoding};
use crate::utils::CodecError;

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { topic: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topic: String },

    /// Without a topic the message goes to the default topic.
    #[serde(rename = "publish")]
    Publish {
        #[serde(default)]
        topic: Option<String>,
        payload: String,
        #[serde(default)]
        encoding: PayloadEncoding,
    },
}

/// Frames the node sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        connection_id: String,
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        affinity: Option<String>,
    },
    Message(Delivery),
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_ws(&self) -> Result<WsMessage, CodecError> {
        Ok(WsMessage::text(serde_json::to_string(self)?))
    }

    pub fn parse(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }
}
