//! Envelope codec.
//!
//! Two encodings carry the same logical fields:
//! - backplane: JSON with the payload always base64-encoded;
//! - client-facing: a `message` frame whose payload is plain text when it is
//!   valid UTF-8 and base64 otherwise, flagged by `encoding`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::Envelope;
use crate::transport::message::ServerMessage;
use crate::utils::CodecError;

/// How a payload string maps to bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Text,
    Base64,
}

/// Client-facing view of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub origin_node: String,
    pub origin_connection: Option<String>,
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub encoding: PayloadEncoding,
    pub sequence: u64,
    pub timestamp: u64,
}

impl Delivery {
    pub fn payload_bytes(&self) -> Result<Bytes, CodecError> {
        decode_payload(&self.payload, self.encoding)
    }
}

impl From<&Envelope> for Delivery {
    fn from(envelope: &Envelope) -> Self {
        let (payload, encoding) = match std::str::from_utf8(envelope.payload()) {
            Ok(text) => (text.to_string(), PayloadEncoding::Text),
            Err(_) => (STANDARD.encode(envelope.payload()), PayloadEncoding::Base64),
        };
        Self {
            origin_node: envelope.origin_node().to_string(),
            origin_connection: envelope.origin_connection().map(str::to_string),
            topic: envelope.topic().to_string(),
            payload,
            encoding,
            sequence: envelope.sequence(),
            timestamp: envelope.timestamp(),
        }
    }
}

/// Serializes an envelope for the backplane.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parses a backplane frame back into an envelope.
pub fn decode(frame: &str) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_str(frame)?)
}

/// Builds the text frame pushed to subscribed clients.
pub fn encode_for_client(envelope: &Envelope) -> Result<WsMessage, CodecError> {
    let frame = ServerMessage::Message(Delivery::from(envelope));
    Ok(WsMessage::text(serde_json::to_string(&frame)?))
}

pub fn decode_payload(payload: &str, encoding: PayloadEncoding) -> Result<Bytes, CodecError> {
    match encoding {
        PayloadEncoding::Text => Ok(Bytes::copy_from_slice(payload.as_bytes())),
        PayloadEncoding::Base64 => Ok(Bytes::from(STANDARD.decode(payload)?)),
    }
}

/// `serde(with)` helper storing `Bytes` as a base64 string.
pub(crate) mod base64_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
