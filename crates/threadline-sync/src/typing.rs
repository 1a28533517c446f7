use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Remote participants currently typing, each with an expiry instant.
///
/// A repeated typing frame from someone already listed pushes their expiry
/// out instead of being ignored, so an active typist never flickers off.
#[derive(Debug, Clone)]
pub struct TypingTracker {
    ttl: Duration,
    expiries: BTreeMap<String, Instant>,
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            expiries: BTreeMap::new(),
        }
    }

    /// Apply an inbound typing frame. Returns true if `user` was not already
    /// marked typing.
    pub fn on_typing(&mut self, user: &str, now: Instant) -> bool {
        let expiry = now + self.ttl;
        match self.expiries.get_mut(user) {
            Some(existing) => {
                *existing = expiry;
                false
            }
            None => {
                self.expiries.insert(user.to_string(), expiry);
                true
            }
        }
    }

    /// Drop every entry whose expiry has passed and return who was removed.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &expired {
            self.expiries.remove(user);
        }
        expired
    }

    /// Earliest pending expiry, if anyone is typing.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.expiries.values().min().copied()
    }

    pub fn is_typing(&self, user: &str) -> bool {
        self.expiries.contains_key(user)
    }

    pub fn users(&self) -> Vec<String> {
        self.expiries.keys().cloned().collect()
    }

    /// Cancel every live expiry.
    pub fn clear(&mut self) {
        self.expiries.clear();
    }
}

/// Gate for our own outbound typing frames.
#[derive(Debug, Clone)]
pub struct TypingThrottle {
    min_gap: Option<Duration>,
    last_sent: Option<Instant>,
}

impl TypingThrottle {
    pub fn new(min_gap: Option<Duration>) -> Self {
        Self {
            min_gap,
            last_sent: None,
        }
    }

    /// Whether an input change at `now` should produce a typing frame.
    pub fn should_send(&self, now: Instant) -> bool {
        match (self.min_gap, self.last_sent) {
            (Some(gap), Some(last)) => now.duration_since(last) >= gap,
            _ => true,
        }
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }
}
