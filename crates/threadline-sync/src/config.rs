use std::time::Duration;

use url::Url;

use threadline_types::models::ThreadId;

use crate::error::{Result, SyncError};

/// Default socket endpoint base. The thread id is appended as a path segment.
pub const DEFAULT_WS_BASE: &str = "ws://localhost:8000/ws/chat";

/// Default REST base. `tenant/` or `admin/` is appended per identity.
pub const DEFAULT_API_BASE: &str = "http://localhost:8000/api";

/// Reconnection schedule: `min(base_delay * 2^attempt, max_delay)`, giving up
/// once `max_retries` consecutive attempts have failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub ws_base: Url,
    pub api_base: Url,
    pub reconnect: ReconnectPolicy,
    /// Quiet window before pending read receipts are flushed.
    pub read_debounce: Duration,
    /// How long a remote participant stays "typing" after their last frame.
    pub typing_ttl: Duration,
    /// Minimum gap between our own outbound typing frames. `None` sends one
    /// frame per input change.
    pub typing_throttle: Option<Duration>,
    /// Extra attempts for failed REST calls.
    pub rest_retries: u32,
    /// Delay before the first REST retry; doubles per retry.
    pub rest_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_base: Url::parse(DEFAULT_WS_BASE).expect("default ws base is a valid url"),
            api_base: Url::parse(DEFAULT_API_BASE).expect("default api base is a valid url"),
            reconnect: ReconnectPolicy::default(),
            read_debounce: Duration::from_millis(300),
            typing_ttl: Duration::from_millis(3000),
            typing_throttle: None,
            rest_retries: 3,
            rest_backoff: Duration::from_millis(500),
        }
    }
}

impl SyncConfig {
    /// Build a config from `THREADLINE_*` environment variables, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SyncConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(base) = lookup("THREADLINE_WS_BASE") {
            config.ws_base = Url::parse(&base)?;
        }
        if let Some(base) = lookup("THREADLINE_API_BASE") {
            config.api_base = Url::parse(&base)?;
        }
        if let Some(ms) = lookup_millis(&lookup, "THREADLINE_READ_DEBOUNCE_MS")? {
            config.read_debounce = ms;
        }
        if let Some(ms) = lookup_millis(&lookup, "THREADLINE_TYPING_TTL_MS")? {
            config.typing_ttl = ms;
        }
        if let Some(ms) = lookup_millis(&lookup, "THREADLINE_TYPING_THROTTLE_MS")? {
            config.typing_throttle = (!ms.is_zero()).then_some(ms);
        }
        if let Some(raw) = lookup("THREADLINE_MAX_RETRIES") {
            config.reconnect.max_retries = raw
                .parse()
                .map_err(|e| SyncError::Config(format!("THREADLINE_MAX_RETRIES={raw}: {e}")))?;
        }

        Ok(config)
    }

    /// Socket URL for a thread: `{ws_base}/{thread_id}/?token={token}`.
    pub fn socket_url(&self, thread_id: ThreadId, token: &str) -> Result<Url> {
        let base = self.ws_base.as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{}/{}/", base, thread_id))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

fn lookup_millis(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    match lookup(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| SyncError::Config(format!("{key}={raw}: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(1000));
        assert_eq!(config.reconnect.max_delay, Duration::from_millis(10_000));
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.read_debounce, Duration::from_millis(300));
        assert_eq!(config.typing_ttl, Duration::from_millis(3000));
        assert!(config.typing_throttle.is_none());
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_lookup_overrides_defaults() {
        let config = SyncConfig::from_lookup(vars(&[
            ("THREADLINE_WS_BASE", "wss://chat.example.com/ws/chat"),
            ("THREADLINE_API_BASE", "https://chat.example.com/api"),
            ("THREADLINE_READ_DEBOUNCE_MS", "150"),
            ("THREADLINE_TYPING_TTL_MS", "5000"),
            ("THREADLINE_TYPING_THROTTLE_MS", "1000"),
            ("THREADLINE_MAX_RETRIES", "2"),
        ]))
        .unwrap();
        assert_eq!(config.ws_base.as_str(), "wss://chat.example.com/ws/chat");
        assert_eq!(config.api_base.as_str(), "https://chat.example.com/api");
        assert_eq!(config.read_debounce, Duration::from_millis(150));
        assert_eq!(config.typing_ttl, Duration::from_millis(5000));
        assert_eq!(config.typing_throttle, Some(Duration::from_millis(1000)));
        assert_eq!(config.reconnect.max_retries, 2);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_throttle_disables_it() {
        let config = SyncConfig::from_lookup(vars(&[("THREADLINE_TYPING_THROTTLE_MS", "0")])).unwrap();
        assert!(config.typing_throttle.is_none());
    }

    #[test]
    fn test_lookup_rejects_bad_values() {
        let err = SyncConfig::from_lookup(vars(&[("THREADLINE_READ_DEBOUNCE_MS", "soon")])).unwrap_err();
        assert!(matches!(err, SyncError::Config(ref msg) if msg.starts_with("THREADLINE_READ_DEBOUNCE_MS=soon")));

        let err = SyncConfig::from_lookup(vars(&[("THREADLINE_MAX_RETRIES", "-1")])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        let err = SyncConfig::from_lookup(vars(&[("THREADLINE_WS_BASE", "not a url")])).unwrap_err();
        assert!(matches!(err, SyncError::Url(_)));
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        // The only test in this crate that touches the process environment.
        unsafe {
            std::env::set_var("THREADLINE_TYPING_TTL_MS", "4500");
            std::env::set_var("THREADLINE_MAX_RETRIES", "3");
        }
        let config = SyncConfig::from_env().unwrap();
        assert_eq!(config.typing_ttl, Duration::from_millis(4500));
        assert_eq!(config.reconnect.max_retries, 3);

        unsafe { std::env::set_var("THREADLINE_MAX_RETRIES", "many") };
        assert!(matches!(SyncConfig::from_env(), Err(SyncError::Config(_))));

        unsafe {
            std::env::remove_var("THREADLINE_TYPING_TTL_MS");
            std::env::remove_var("THREADLINE_MAX_RETRIES");
        }
        assert_eq!(SyncConfig::from_env().unwrap().typing_ttl, Duration::from_millis(3000));
    }

    #[test]
    fn test_socket_url_carries_token() {
        let config = SyncConfig::default();
        let url = config.socket_url(42, "abc.def").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/chat/42/?token=abc.def");
    }

    #[test]
    fn test_socket_url_tolerates_trailing_slash() {
        let config = SyncConfig {
            ws_base: Url::parse("wss://chat.example.com/ws/chat/").unwrap(),
            ..SyncConfig::default()
        };
        let url = config.socket_url(7, "t").unwrap();
        assert_eq!(url.as_str(), "wss://chat.example.com/ws/chat/7/?token=t");
    }
}
