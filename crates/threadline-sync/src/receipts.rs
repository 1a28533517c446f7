use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use threadline_types::models::MessageId;

use crate::debounce::Debounce;
use crate::timeline::Timeline;

/// Decides which messages to acknowledge as read and batches the
/// acknowledgements behind a debounce window.
///
/// Messages that were already in the thread when the session began are
/// never marked automatically; only messages that arrive while the thread is
/// open qualify. Pending ids survive a disconnect and go out on the next
/// flush after the socket reopens.
#[derive(Debug, Clone)]
pub struct ReadReceiptBatcher {
    me: String,
    initial: HashSet<MessageId>,
    pending: BTreeSet<MessageId>,
    debounce: Debounce,
    page_visible: bool,
}

impl ReadReceiptBatcher {
    pub fn new(me: impl Into<String>, initial: impl IntoIterator<Item = MessageId>, window: Duration) -> Self {
        Self {
            me: me.into(),
            initial: initial.into_iter().collect(),
            pending: BTreeSet::new(),
            debounce: Debounce::new(window),
            page_visible: true,
        }
    }

    /// Whether a visibility signal for `id` should queue a read receipt.
    pub fn is_eligible(&self, id: MessageId, timeline: &Timeline) -> bool {
        let Some(message) = timeline.get(id) else {
            return false;
        };
        !self.initial.contains(&id)
            && message.sender != self.me
            && !message.is_read_by(&self.me)
            && !self.pending.contains(&id)
    }

    /// A rendered message crossed the visibility threshold. Returns true if
    /// it was queued.
    pub fn element_became_visible(&mut self, id: MessageId, timeline: &Timeline, now: Instant) -> bool {
        if !self.page_visible || !self.is_eligible(id, timeline) {
            return false;
        }
        self.pending.insert(id);
        self.debounce.arm(now);
        debug!("queued read receipt for message {} ({} pending)", id, self.pending.len());
        true
    }

    /// Track page visibility. Returns true when the page just became visible
    /// with receipts pending, i.e. the caller should flush now.
    pub fn set_page_visible(&mut self, visible: bool) -> bool {
        let regained = visible && !self.page_visible;
        self.page_visible = visible;
        regained && !self.pending.is_empty()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debounce.deadline()
    }

    /// Whether the debounce window elapsed. Disarms when it has.
    pub fn is_due(&mut self, now: Instant) -> bool {
        self.debounce.is_due(now)
    }

    /// Start a flush: disarm the debounce and return every pending id. Each
    /// id stays pending until [`ReadReceiptBatcher::complete`] confirms it
    /// went out.
    pub fn flush(&mut self) -> Vec<MessageId> {
        self.debounce.flush();
        self.pending.iter().copied().collect()
    }

    /// The read frame for `id` was handed to the socket.
    pub fn complete(&mut self, id: MessageId) {
        self.pending.remove(&id);
    }

    /// A read by us was applied to `id` (server echo or local reconcile);
    /// it no longer needs acknowledging.
    pub fn forget(&mut self, id: MessageId) {
        if self.pending.remove(&id) && self.pending.is_empty() {
            self.debounce.cancel();
        }
    }

    /// After a successful bulk "mark all read", return the ids the per-message
    /// flow would still have to acknowledge and drop them from pending.
    pub fn reconcile_all_read(&mut self, timeline: &Timeline) -> Vec<MessageId> {
        let unread = timeline.unread_ids(&self.me);
        for id in &unread {
            self.pending.remove(id);
        }
        if self.pending.is_empty() {
            self.debounce.cancel();
        }
        unread
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: MessageId) -> bool {
        self.pending.contains(&id)
    }

    /// Drop all pending state and the debounce timer.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.debounce.cancel();
    }
}
