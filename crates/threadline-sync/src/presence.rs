use std::collections::BTreeSet;

/// Participants currently online in the thread.
#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    online: BTreeSet<String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a presence frame. Returns whether the set changed.
    pub fn apply(&mut self, user: &str, online: bool) -> bool {
        if online {
            self.online.insert(user.to_string())
        } else {
            self.online.remove(user)
        }
    }

    pub fn is_online(&self, user: &str) -> bool {
        self.online.contains(user)
    }

    pub fn online(&self) -> Vec<String> {
        self.online.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.online.clear();
    }
}
