use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message, http::StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, SyncError};

/// Close codes that mean the server refused our credentials.
const AUTH_CLOSE_CODES: [u16; 3] = [1008, 4401, 4403];

/// Close frame details, when the peer sent one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn is_auth_rejection(&self) -> bool {
        AUTH_CLOSE_CODES.contains(&self.code)
    }
}

/// What the socket reader reports to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// The socket is gone. No further events follow.
    Closed(Option<CloseInfo>),
}

/// One live socket, as a pair of channels. Dropping `outbound` closes the
/// socket.
#[derive(Debug)]
pub struct SocketPair {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens sockets for a thread session.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: Url) -> impl Future<Output = Result<SocketPair>> + Send;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&self, url: Url) -> Result<SocketPair> {
        let (ws, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(tungstenite::Error::Http(response))
                if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
            {
                return Err(SyncError::Auth(format!("handshake rejected with {}", response.status())));
            }
            Err(e) => return Err(SyncError::Connection(e.to_string())),
        };
        info!("socket connected to {}", redact_token(&url));

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        // Writer: forward outbound frames until the session drops its sender.
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::text(text)).await {
                    debug!("socket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: forward text frames, then report how the socket ended.
        tokio::spawn(async move {
            let close = loop {
                tokio::select! {
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(SocketEvent::Text(text.to_string())).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map(|f| CloseInfo {
                                code: u16::from(f.code),
                                reason: f.reason.to_string(),
                            });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("socket read failed: {}", e);
                            break None;
                        }
                        None => break None,
                    },
                    _ = inbound_tx.closed() => return,
                }
            };
            let _ = inbound_tx.send(SocketEvent::Closed(close));
        });

        Ok(SocketPair { outbound, inbound })
    }
}

/// Strip the token query parameter before a URL goes into the logs.
pub fn redact_token(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(None);
    redacted.to_string()
}
