use thiserror::Error;

use crate::backoff::ConnectionState;

/// Errors surfaced by the sync engine.
///
/// Transient socket failures (`Connection`) are retried internally and only
/// reach callers through the terminal `Failed` state. `Parse` never leaves
/// the session actor; it exists so the transport and tests can name it.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("malformed frame: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("cannot send while connection is {state}")]
    InvalidSend { state: ConnectionState },

    #[error("message has no content")]
    EmptyMessage,

    #[error("request failed: {0}")]
    Rest(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("thread session is closed")]
    SessionClosed,
}

impl SyncError {
    /// Whether the failure should skip backoff and end the session.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
