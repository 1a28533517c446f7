use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Server-assigned message primary key, unique within a thread.
pub type MessageId = i64;

/// Server-assigned thread primary key.
pub type ThreadId = i64;

/// Message body. A message carries free text or a structured key/value
/// record, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Structured(Map<String, Value>),
}

/// A single reader's acknowledgement of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

/// Message as it appears both in the thread snapshot and in inbound
/// `message` frames. `content` and `structured` are both optional on the
/// wire; [`Message`] folds them into a [`Payload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: MessageId,
    pub sender: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub structured: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(default)]
    pub read_receipts: Vec<ReadReceipt>,
}

/// A chat message in a thread. Append-only: after creation only the reader
/// set and receipt list grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireMessage", into = "WireMessage")]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub is_admin: bool,
    pub read_by: BTreeSet<String>,
    pub read_receipts: Vec<ReadReceipt>,
}

impl Message {
    /// Position of this message in the thread log.
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }

    pub fn is_read_by(&self, user: &str) -> bool {
        self.read_by.contains(user)
    }

    /// Record `user` as a reader. Returns false if they were already
    /// recorded, in which case nothing changes.
    pub fn record_read(&mut self, user: &str, timestamp: DateTime<Utc>) -> bool {
        if !self.read_by.insert(user.to_string()) {
            return false;
        }
        if !self.read_receipts.iter().any(|r| r.user == user) {
            self.read_receipts.push(ReadReceipt {
                user: user.to_string(),
                timestamp,
            });
        }
        true
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        let payload = match wire.structured {
            Some(Value::Object(map)) if !map.is_empty() => Payload::Structured(map),
            _ => Payload::Text(wire.content.unwrap_or_default()),
        };

        // The reader set always covers the receipt list.
        let mut read_by: BTreeSet<String> = wire.read_by.into_iter().collect();
        let mut read_receipts: Vec<ReadReceipt> = Vec::with_capacity(wire.read_receipts.len());
        for receipt in wire.read_receipts {
            if read_receipts.iter().any(|r| r.user == receipt.user) {
                continue;
            }
            read_by.insert(receipt.user.clone());
            read_receipts.push(receipt);
        }

        Self {
            id: wire.id,
            sender: wire.sender,
            payload,
            created_at: wire.created_at,
            is_admin: wire.is_admin,
            read_by,
            read_receipts,
        }
    }
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let (content, structured) = match message.payload {
            Payload::Text(text) => (Some(text), None),
            Payload::Structured(map) => (None, Some(Value::Object(map))),
        };
        Self {
            id: message.id,
            sender: message.sender,
            content,
            structured,
            created_at: message.created_at,
            is_admin: message.is_admin,
            read_by: message.read_by.into_iter().collect(),
            read_receipts: message.read_receipts,
        }
    }
}
