use std::fmt;
use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Lifecycle of the one socket session a thread owns.
///
/// ```text
/// Connecting -> Open -> Closed -> WaitingToRetry -> Connecting
///                          \-> Failed (retries exhausted or auth rejected)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Resting state after the session is closed. A dropped socket passes
    /// through it on the way to `WaitingToRetry` or `Failed` within the same
    /// step, so views only report it once the session has been torn down.
    Closed,
    WaitingToRetry,
    /// Terminal until an explicit reconnect.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::WaitingToRetry => "waiting to retry",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to do after the socket closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then start connection attempt number `attempt`.
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// Retry counter for one thread session.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Retries made since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The socket reached `Open`.
    pub fn on_open(&mut self) {
        self.attempt = 0;
    }

    /// Explicit user reconnect after `Failed`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The socket closed (or never opened). Auth rejections are never retried.
    pub fn on_closed(&mut self, auth_rejected: bool) -> RetryDecision {
        if auth_rejected || self.attempt >= self.policy.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        RetryDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }

    /// `min(base * 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.policy
            .base_delay
            .checked_mul(factor)
            .map_or(self.policy.max_delay, |d| d.min(self.policy.max_delay))
    }
}
