use std::sync::Arc;

use tracing::info;

use threadline_types::api::ThreadResponse;
use threadline_types::models::ThreadId;

use crate::api::ThreadApi;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::identity::Identity;
use crate::session::{SessionHandle, ThreadSession};
use crate::transport::{Connector, WsConnector};

/// Keeps at most one live thread session. Opening a thread closes the
/// previous session before the new socket is dialed.
pub struct ChatClient<C: Connector = WsConnector> {
    config: SyncConfig,
    connector: Arc<C>,
    api: ThreadApi,
    token: String,
    identity: Identity,
    active: Option<SessionHandle>,
}

impl ChatClient<WsConnector> {
    pub fn connect_with_token(config: SyncConfig, token: impl Into<String>) -> Result<Self> {
        Self::new(config, WsConnector, token)
    }
}

impl<C: Connector> ChatClient<C> {
    /// The identity is read from the token's claims.
    pub fn new(config: SyncConfig, connector: C, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let identity = Identity::from_token(&token)?;
        let api = ThreadApi::new(&config, &identity, token.clone());
        info!("signed in as {} ({})", identity.username, identity.api_scope());
        Ok(Self {
            config,
            connector: Arc::new(connector),
            api,
            token,
            identity,
            active: None,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn active(&self) -> Option<&SessionHandle> {
        self.active.as_ref()
    }

    /// Load a thread over REST and switch the live session to it.
    pub async fn open_thread(&mut self, thread_id: ThreadId) -> Result<&SessionHandle> {
        self.close_active().await;
        let seed = self.api.fetch_thread(thread_id).await?;
        self.attach(seed).await
    }

    /// Switch the live session to an already loaded thread.
    pub async fn attach(&mut self, seed: ThreadResponse) -> Result<&SessionHandle> {
        self.close_active().await;
        let handle = ThreadSession::open(
            self.config.clone(),
            Arc::clone(&self.connector),
            seed,
            &self.token,
            self.identity.clone(),
        )?;
        Ok(self.active.insert(handle))
    }

    pub async fn mark_all_read(&self) -> Result<usize> {
        let session = self.active.as_ref().ok_or(SyncError::SessionClosed)?;
        session.mark_all_read(&self.api).await
    }

    pub async fn close_active(&mut self) {
        if let Some(session) = self.active.take() {
            session.close().await;
        }
    }
}
