use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use threadline_types::models::{Message, MessageId, ReadReceipt};

/// Reads for messages we have not seen yet are parked until the message
/// arrives. Past this many parked messages, new ones are dropped.
const MAX_PARKED_READS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The reader was added to the message.
    Applied,
    /// The reader was already recorded; nothing changed.
    AlreadyRead,
    /// The message is not in the log yet; the read was parked.
    Parked,
}

/// Ordered, deduplicated message log for one thread.
///
/// Sorted ascending by `(created_at, id)` regardless of arrival order. The
/// log is shared with readers as a copy-on-write snapshot: handing out a
/// snapshot is a refcount bump, and the next mutation clones only if that
/// snapshot is still alive.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    messages: Arc<Vec<Message>>,
    /// id -> created_at, for dedup and for locating a message by binary search.
    index: HashMap<MessageId, DateTime<Utc>>,
    parked: HashMap<MessageId, Vec<ReadReceipt>>,
}

impl Timeline {
    /// Seed from the thread history. Duplicate ids keep their first occurrence.
    pub fn seed(history: Vec<Message>) -> Self {
        let mut index = HashMap::with_capacity(history.len());
        let mut messages: Vec<Message> = history
            .into_iter()
            .filter(|m| index.insert(m.id, m.created_at).is_none())
            .collect();
        messages.sort_by_key(Message::sort_key);

        Self {
            messages: Arc::new(messages),
            index,
            parked: HashMap::new(),
        }
    }

    /// Insert a message in order. Returns false (and changes nothing) if its
    /// id is already present.
    pub fn insert(&mut self, mut message: Message) -> bool {
        if self.index.contains_key(&message.id) {
            debug!("message {} already in timeline, ignoring", message.id);
            return false;
        }

        if let Some(reads) = self.parked.remove(&message.id) {
            for receipt in reads {
                message.record_read(&receipt.user, receipt.timestamp);
            }
        }

        let key = message.sort_key();
        self.index.insert(message.id, message.created_at);
        let messages = Arc::make_mut(&mut self.messages);
        let pos = messages.partition_point(|m| m.sort_key() < key);
        messages.insert(pos, message);
        true
    }

    /// Record that `user` read message `id`. Idempotent per (message, user).
    pub fn apply_read(&mut self, id: MessageId, user: &str, timestamp: DateTime<Utc>) -> ReadOutcome {
        let Some(pos) = self.position(id) else {
            self.park_read(id, user, timestamp);
            return ReadOutcome::Parked;
        };

        if self.messages[pos].is_read_by(user) {
            return ReadOutcome::AlreadyRead;
        }
        Arc::make_mut(&mut self.messages)[pos].record_read(user, timestamp);
        ReadOutcome::Applied
    }

    fn park_read(&mut self, id: MessageId, user: &str, timestamp: DateTime<Utc>) {
        if !self.parked.contains_key(&id) && self.parked.len() >= MAX_PARKED_READS {
            warn!("dropping read of unknown message {} by {}: too many parked reads", id, user);
            return;
        }
        let reads = self.parked.entry(id).or_default();
        if !reads.iter().any(|r| r.user == user) {
            reads.push(ReadReceipt {
                user: user.to_string(),
                timestamp,
            });
        }
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        let created_at = *self.index.get(&id)?;
        self.messages
            .binary_search_by_key(&(created_at, id), Message::sort_key)
            .ok()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.position(id).map(|pos| &self.messages[pos])
    }

    /// Messages from someone else that `me` has not read.
    pub fn unread_count(&self, me: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.sender != me && !m.is_read_by(me))
            .count()
    }

    pub fn unread_ids(&self, me: &str) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| m.sender != me && !m.is_read_by(me))
            .map(|m| m.id)
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.messages.iter().map(|m| m.id)
    }

    /// Immutable view of the log as of now.
    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        Arc::clone(&self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
