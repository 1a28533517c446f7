use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use threadline_types::api::ThreadResponse;
use threadline_types::models::ThreadId;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::identity::Identity;

/// REST collaborator: loads the thread snapshot that seeds a session, and
/// performs the bulk "mark all read" action.
#[derive(Debug, Clone)]
pub struct ThreadApi {
    client: Client,
    base: Url,
    scope: &'static str,
    token: String,
    retries: u32,
    backoff: Duration,
}

impl ThreadApi {
    pub fn new(config: &SyncConfig, identity: &Identity, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), config, identity, token)
    }

    /// Use a preconfigured HTTP client (proxy, TLS roots, timeouts).
    pub fn with_client(client: Client, config: &SyncConfig, identity: &Identity, token: impl Into<String>) -> Self {
        Self {
            client,
            base: config.api_base.clone(),
            scope: identity.api_scope(),
            token: token.into(),
            retries: config.rest_retries,
            backoff: config.rest_backoff,
        }
    }

    /// `{api_base}/{tenant|admin}/threads/{id}/{action}`
    pub fn thread_url(&self, thread_id: ThreadId, action: Option<&str>) -> Result<Url> {
        let base = self.base.as_str().trim_end_matches('/');
        let mut raw = format!("{}/{}/threads/{}/", base, self.scope, thread_id);
        if let Some(action) = action {
            raw.push_str(action);
            raw.push('/');
        }
        Ok(Url::parse(&raw)?)
    }

    /// Thread metadata plus its full message history.
    pub async fn fetch_thread(&self, thread_id: ThreadId) -> Result<ThreadResponse> {
        let url = self.thread_url(thread_id, None)?;
        let response = self.send_with_retry(|| self.client.get(url.clone())).await?;
        let thread: ThreadResponse = response.json().await?;
        debug!("loaded thread {} with {} messages", thread.id, thread.messages.len());
        Ok(thread)
    }

    /// Mark every message in the thread read for the current user.
    pub async fn mark_all_read(&self, thread_id: ThreadId) -> Result<()> {
        let url = self.thread_url(thread_id, Some("mark-all-read"))?;
        self.send_with_retry(|| self.client.post(url.clone())).await?;
        Ok(())
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            let result = build().bearer_auth(&self.token).send().await;
            let err = match result {
                Ok(response) => match response.status() {
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        return Err(SyncError::Auth(format!("server returned {}", response.status())));
                    }
                    _ => match response.error_for_status() {
                        Ok(response) => return Ok(response),
                        Err(e) => e,
                    },
                },
                Err(e) => e,
            };

            if attempt >= self.retries {
                return Err(err.into());
            }
            attempt += 1;
            warn!("request failed ({}), retry {}/{} in {:?}", err, attempt, self.retries, delay);
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}
