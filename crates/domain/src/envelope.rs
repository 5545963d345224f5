//! Wire shapes for the downstream envelope and the inbound ack message.
//! Construction of [`Envelope`] — the field-embedding rule — lives in the
//! bridge crate's envelope builder; this module only fixes the byte shape
//! both sides agree on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisRef {
    pub id: String,
    pub stream: String,
    pub ack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisPayload {
    pub payload: RedisRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    /// The entry's fields, re-serialized under the field-embedding rule.
    pub payload: Value,
}

/// The outgoing downstream payload, byte-exact on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message: MessagePayload,
    pub redis: RedisPayload,
}

/// The inbound ack message received on the ack topic.
///
/// Additional fields beyond `id`/`stream`/`ack` are ignored by `serde`
/// automatically, so unrecognized fields a publisher adds don't break parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessage {
    pub id: String,
    pub stream: String,
    pub ack: bool,
}

impl AckMessage {
    /// `id` and `stream` must be non-empty for the ack to be actionable.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.stream.is_empty()
    }
}
