use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{MessageId, WireMessage};

/// Frames received FROM the server over the per-thread socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A message was posted to the thread
    Message(WireMessage),

    /// A participant is typing
    Typing { user: String },

    /// A participant read a message
    Read {
        message_id: MessageId,
        user: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        read_count: Option<u32>,
    },

    /// A participant came online or went offline
    Presence { user: String, online: bool },

    /// The server persisted a message we sent
    Confirmation {
        #[serde(default)]
        status: String,
        message_id: MessageId,
    },

    /// The server failed to process one of our frames
    Error {
        #[serde(default)]
        detail: String,
    },
}

impl ServerFrame {
    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Typing { .. } => "typing",
            Self::Read { .. } => "read",
            Self::Presence { .. } => "presence",
            Self::Confirmation { .. } => "confirmation",
            Self::Error { .. } => "error",
        }
    }
}

/// Frames sent FROM the client TO the server.
///
/// Text and structured messages share the `message` tag on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename = "message")]
    Text { content: String },

    #[serde(rename = "message")]
    Structured { structured: Map<String, Value> },

    Typing,

    Read { message_id: MessageId },
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } | Self::Structured { .. } => "message",
            Self::Typing => "typing",
            Self::Read { .. } => "read",
        }
    }
}
