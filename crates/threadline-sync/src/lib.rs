//! Real-time thread synchronization for the incident chat client.
//!
//! One [`SessionHandle`] per open thread owns a socket, an ordered and
//! deduplicated message timeline, presence and typing trackers, and the
//! debounced read-receipt batcher. Reconnects back off exponentially and give
//! up after a bounded number of attempts.

pub mod api;
pub mod backoff;
pub mod client;
pub mod config;
pub mod debounce;
pub mod error;
pub mod identity;
pub mod presence;
pub mod receipts;
pub mod session;
pub mod timeline;
pub mod transport;
pub mod typing;

pub use api::ThreadApi;
pub use backoff::{ConnectionState, Reconnector, RetryDecision};
pub use client::ChatClient;
pub use config::{ReconnectPolicy, SyncConfig};
pub use error::{Result, SyncError};
pub use identity::Identity;
pub use session::{SessionHandle, ThreadSession, ThreadView};
pub use transport::{CloseInfo, Connector, SocketEvent, SocketPair, WsConnector};
