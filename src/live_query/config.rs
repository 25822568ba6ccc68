// src/live_query/config.rs

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use url::Url;

use crate::error::ParseError;

/// Default for [`LiveQueryConfig::max_connection_attempts`].
pub const DEFAULT_MAX_CONNECTION_ATTEMPTS: u32 = 20;

/// Connection settings of a [`ParseLiveQuery`](crate::live_query::ParseLiveQuery) client.
#[derive(Debug, Clone)]
pub struct LiveQueryConfig {
    pub server_url: Url,
    pub application_id: String,
    pub client_key: Option<String>,
    pub master_key: Option<String>,
    pub maintenance_key: Option<String>,
    /// How many consecutive failed connections are retried before giving up.
    pub max_connection_attempts: u32,
    /// Whether `connect`, `subscribe` and `update` carry the installation id and
    /// session token.
    pub connection_additional_properties: bool,
    /// Upper bound for establishing the socket and for the server's `connected` reply.
    pub connect_timeout: Duration,
    /// How long `close` waits for the close handshake.
    pub close_grace_period: Duration,
    /// Delay between reconnect attempts. `None` retries immediately.
    pub reconnect_backoff: Option<ReconnectBackoff>,
}

impl LiveQueryConfig {
    /// Creates a configuration for the LiveQuery server at `server_url`.
    ///
    /// `http`/`https` URLs are accepted and rewritten to `ws`/`wss`.
    pub fn new(server_url: &str, application_id: &str) -> Result<Self, ParseError> {
        if application_id.is_empty() {
            return Err(ParseError::InvalidInput(
                "application_id cannot be empty".to_string(),
            ));
        }
        Ok(LiveQueryConfig {
            server_url: websocket_url(server_url)?,
            application_id: application_id.to_string(),
            client_key: None,
            master_key: None,
            maintenance_key: None,
            max_connection_attempts: DEFAULT_MAX_CONNECTION_ATTEMPTS,
            connection_additional_properties: true,
            connect_timeout: Duration::from_secs(10),
            close_grace_period: Duration::from_secs(5),
            reconnect_backoff: None,
        })
    }

    pub fn with_client_key(mut self, client_key: &str) -> Self {
        self.client_key = Some(client_key.to_string());
        self
    }

    pub fn with_master_key(mut self, master_key: &str) -> Self {
        self.master_key = Some(master_key.to_string());
        self
    }

    pub fn with_maintenance_key(mut self, maintenance_key: &str) -> Self {
        self.maintenance_key = Some(maintenance_key.to_string());
        self
    }

    pub fn with_max_connection_attempts(mut self, attempts: u32) -> Self {
        self.max_connection_attempts = attempts;
        self
    }

    pub fn with_connection_additional_properties(mut self, enabled: bool) -> Self {
        self.connection_additional_properties = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_close_grace_period(mut self, grace: Duration) -> Self {
        self.close_grace_period = grace;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.reconnect_backoff = Some(backoff);
        self
    }
}

/// Exponential delay between reconnect attempts.
///
/// Not enabled by default: without it every attempt follows the previous one
/// immediately, up to `max_connection_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectBackoff {
    /// Delay before attempt number `attempt` (1-based): `initial * 2^(attempt-1)`,
    /// capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        ReconnectBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

/// Rewrites an `http(s)` URL to `ws(s)`; adds `ws://` when no scheme is given.
pub fn websocket_url(server_url: &str) -> Result<Url, ParseError> {
    let with_scheme = if server_url.contains("://") {
        server_url.to_string()
    } else {
        format!("ws://{}", server_url)
    };
    let mut url = Url::parse(&with_scheme)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ParseError::InvalidUrl(format!(
                "unsupported LiveQuery URL scheme '{}' in {}",
                other, server_url
            )))
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        ParseError::InvalidUrl(format!("cannot use scheme '{}' for {}", scheme, server_url))
    })?;
    Ok(url)
}

/// Supplies the installation id and session token sent when connecting.
///
/// Both are read every time a `connect`, `subscribe` or `update` message is built,
/// so a token changed after login is picked up on the next message.
pub trait CredentialsProvider: Send + Sync {
    fn installation_id(&self) -> Option<String>;

    fn session_token(&self) -> Option<String>;
}

/// Thread-safe credentials that can be changed while a client is running.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    installation_id: RwLock<Option<String>>,
    session_token: RwLock<Option<String>>,
}

impl StaticCredentials {
    pub fn new(installation_id: Option<String>, session_token: Option<String>) -> Self {
        StaticCredentials {
            installation_id: RwLock::new(installation_id),
            session_token: RwLock::new(session_token),
        }
    }

    pub fn set_installation_id(&self, installation_id: Option<String>) {
        *self
            .installation_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = installation_id;
    }

    pub fn set_session_token(&self, session_token: Option<String>) {
        *self
            .session_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session_token;
    }
}

impl CredentialsProvider for StaticCredentials {
    fn installation_id(&self) -> Option<String> {
        self.installation_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn session_token(&self) -> Option<String> {
        self.session_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_urls_become_websocket_urls() {
        assert_eq!(
            websocket_url("http://localhost:1337/parse").unwrap().as_str(),
            "ws://localhost:1337/parse"
        );
        assert_eq!(
            websocket_url("https://example.com").unwrap().as_str(),
            "wss://example.com/"
        );
        assert_eq!(
            websocket_url("localhost:1337").unwrap().as_str(),
            "ws://localhost:1337/"
        );
        assert!(websocket_url("ftp://example.com").is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = ReconnectBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(64), Duration::from_secs(1));
    }

    #[test]
    fn test_config_defaults() {
        let config = LiveQueryConfig::new("http://localhost:1337", "app").unwrap();
        assert_eq!(config.max_connection_attempts, DEFAULT_MAX_CONNECTION_ATTEMPTS);
        assert!(config.connection_additional_properties);
        assert!(config.reconnect_backoff.is_none());
        assert!(LiveQueryConfig::new("http://localhost:1337", "").is_err());
    }

    #[test]
    fn test_static_credentials_can_change() {
        let credentials = StaticCredentials::new(Some("install".to_string()), None);
        assert_eq!(credentials.session_token(), None);
        credentials.set_session_token(Some("r:abc".to_string()));
        assert_eq!(credentials.session_token().as_deref(), Some("r:abc"));
        assert_eq!(credentials.installation_id().as_deref(), Some("install"));
    }
}
