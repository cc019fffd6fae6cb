/// Sync protocol message types shared by the relay, the replica session and
/// the direct peer channel.
///
/// Protocol:
///   Every new link starts with HELLO { senderId, version, respond: true }.
///   The receiver answers with TASK_SYNC (updates the sender is missing) and,
///   if asked to, its own HELLO { respond: false }.
///   Local mutations are sent as TASK_SYNC carrying the incremental update.
///
/// `version` and `updates` are base64-encoded binary (Loro version vectors
/// and update blobs). `tasks` in TASK_SYNC is the sender's materialized view
/// and is never used for merging.
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::types::Task;

fn b64() -> base64::engine::general_purpose::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    b64().encode(bytes)
}

pub fn decode_bytes(text: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(b64().decode(text)?)
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed binary payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
    #[serde(rename_all = "camelCase")]
    Hello {
        sender_id: String,
        version: String,
        #[serde(default)]
        respond: bool,
    },
    #[serde(rename_all = "camelCase")]
    TaskSync {
        #[serde(default)]
        tasks: Vec<Task>,
        timestamp: i64,
        sender_id: String,
        #[serde(default)]
        updates: String,
    },
    #[serde(rename_all = "camelCase")]
    Bye { sender_id: String },
    /// Sent by the relay itself whenever a room's connection count changes.
    Presence { connections: usize },
    #[serde(rename_all = "camelCase")]
    Offer {
        sender_id: String,
        recipient_id: String,
        endpoints: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        sender_id: String,
        recipient_id: String,
        accepted: bool,
    },
}

impl SyncMessage {
    pub fn hello(sender_id: &str, version: &[u8], respond: bool) -> Self {
        SyncMessage::Hello {
            sender_id: sender_id.to_string(),
            version: encode_bytes(version),
            respond,
        }
    }

    pub fn task_sync(sender_id: &str, tasks: Vec<Task>, updates: &[u8]) -> Self {
        SyncMessage::TaskSync {
            tasks,
            timestamp: chrono::Utc::now().timestamp_millis(),
            sender_id: sender_id.to_string(),
            updates: encode_bytes(updates),
        }
    }

    pub fn bye(sender_id: &str) -> Self {
        SyncMessage::Bye {
            sender_id: sender_id.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Originating replica, if the message has one.
    pub fn sender_id(&self) -> Option<&str> {
        match self {
            SyncMessage::Hello { sender_id, .. }
            | SyncMessage::TaskSync { sender_id, .. }
            | SyncMessage::Bye { sender_id }
            | SyncMessage::Offer { sender_id, .. }
            | SyncMessage::Answer { sender_id, .. } => Some(sender_id),
            SyncMessage::Presence { .. } => None,
        }
    }

    /// Whether a message is meant for `peer_id`. Signaling messages name a
    /// single recipient, everything else is for the whole room.
    pub fn is_for(&self, peer_id: &str) -> bool {
        match self {
            SyncMessage::Offer { recipient_id, .. } | SyncMessage::Answer { recipient_id, .. } => {
                recipient_id == peer_id
            }
            _ => true,
        }
    }
}
