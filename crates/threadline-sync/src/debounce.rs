use std::time::Duration;

use tokio::time::Instant;

/// Trailing-edge debounce: every trigger pushes the deadline out by the
/// window, and the action runs once the window passes with no new trigger.
///
/// Holds no timer itself. The owner sleeps until [`Debounce::deadline`] and
/// then calls [`Debounce::is_due`], or forces the action with
/// [`Debounce::flush`].
#[derive(Debug, Clone)]
pub struct Debounce {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// (Re)arm the window starting at `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the window has elapsed. Disarms when it has.
    pub fn is_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Disarm immediately. Returns whether a trigger was outstanding.
    pub fn flush(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}
