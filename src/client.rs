// src/client.rs

use std::sync::Arc;

use url::Url;

use crate::error::ParseError;
use crate::live_query::config::{
    websocket_url, CredentialsProvider, LiveQueryConfig, StaticCredentials,
    DEFAULT_MAX_CONNECTION_ATTEMPTS,
};
use crate::live_query::ParseLiveQuery;

/// Application-level configuration for a Parse Server instance.
///
/// `Parse` holds the server URL, the Application ID and keys, and the credentials of
/// the current user and installation. It is the usual starting point for building a
/// [`ParseLiveQuery`] client: the LiveQuery URL defaults to the server URL with its
/// scheme switched to `ws`/`wss`.
///
/// The session token and installation id are shared between a `Parse` and all of its
/// clones and every LiveQuery client built from it, so a token set after login is sent
/// with the next `connect`, `subscribe` or `update` message.
///
/// # Initialization
///
/// ```rust,no_run
/// use parse_live_query::Parse;
/// # use parse_live_query::ParseError;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), ParseError> {
/// let parse = Parse::new("http://localhost:1337/parse", "myAppId", Some("myClientKey"), None)?;
/// parse.set_session_token(Some("r:abc123".to_string()));
///
/// let live_query = parse.live_query()?;
/// live_query.open(true).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Parse {
    pub server_url: String,
    pub(crate) app_id: String,
    pub(crate) client_key: Option<String>,
    pub(crate) master_key: Option<String>,
    pub(crate) maintenance_key: Option<String>,
    pub(crate) live_query_server_url: Option<Url>,
    pub(crate) max_connection_attempts: u32,
    pub(crate) connection_additional_properties: bool,
    credentials: Arc<StaticCredentials>,
}

impl Parse {
    /// Creates a new `Parse` configuration.
    ///
    /// # Arguments
    ///
    /// * `server_url`: The base URL of your Parse Server (e.g., `"http://localhost:1337/parse"`).
    ///   `http://` is assumed when no scheme is given.
    /// * `app_id`: Your Parse Application ID, sent with every `connect` message.
    /// * `client_key`: Optional. The client (JavaScript) key configured on the server.
    /// * `master_key`: Optional. Your Parse Master Key. LiveQuery connections made with the
    ///   master key bypass ACLs and Class-Level Permissions; use it only from trusted code.
    ///
    /// # Returns
    ///
    /// A `Result` containing the new `Parse` instance, or a `ParseError` if the Application
    /// ID is empty or the URL is not a usable base URL.
    pub fn new(
        server_url: &str,
        app_id: &str,
        client_key: Option<&str>,
        master_key: Option<&str>,
    ) -> Result<Self, ParseError> {
        if app_id.is_empty() {
            return Err(ParseError::InvalidInput(
                "app_id cannot be empty".to_string(),
            ));
        }

        let mut temp_url_string = server_url.to_string();

        // Ensure scheme is present
        if !temp_url_string.contains("://") {
            temp_url_string = format!("http://{}", temp_url_string);
        }

        let parsed_server_url = Url::parse(&temp_url_string)?;

        if parsed_server_url.cannot_be_a_base() {
            return Err(ParseError::SdkError(format!(
                "The server_url '{}' (after ensuring scheme) resolved to '{}', which cannot be a base URL. Please provide a full base URL (e.g., http://localhost:1337/parse).",
                server_url, parsed_server_url
            )));
        }

        let final_server_url = parsed_server_url.as_str().trim_end_matches('/').to_string();
        log::debug!("Parse initialized with server_url: {}", final_server_url);

        Ok(Self {
            server_url: final_server_url,
            app_id: app_id.to_string(),
            client_key: client_key.map(|s| s.to_string()),
            master_key: master_key.map(|s| s.to_string()),
            maintenance_key: None,
            live_query_server_url: None,
            max_connection_attempts: DEFAULT_MAX_CONNECTION_ATTEMPTS,
            connection_additional_properties: true,
            credentials: Arc::new(StaticCredentials::default()),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn with_maintenance_key(mut self, maintenance_key: &str) -> Self {
        self.maintenance_key = Some(maintenance_key.to_string());
        self
    }

    /// Uses a dedicated LiveQuery server instead of deriving its URL from `server_url`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use parse_live_query::{Parse, ParseError};
    /// # fn main() -> Result<(), ParseError> {
    /// let parse = Parse::new("https://api.example.com/parse", "myAppId", None, None)?
    ///     .with_live_query_server_url("wss://live.example.com")?;
    /// assert_eq!(parse.live_query_config()?.server_url.as_str(), "wss://live.example.com/");
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_live_query_server_url(mut self, url: &str) -> Result<Self, ParseError> {
        self.live_query_server_url = Some(websocket_url(url)?);
        Ok(self)
    }

    pub fn with_max_connection_attempts(mut self, attempts: u32) -> Self {
        self.max_connection_attempts = attempts;
        self
    }

    /// Whether the installation id and session token are sent to the LiveQuery server.
    /// Enabled by default.
    pub fn with_connection_additional_properties(mut self, enabled: bool) -> Self {
        self.connection_additional_properties = enabled;
        self
    }

    /// Sets or clears the session token of the current user.
    pub fn set_session_token(&self, token: Option<String>) {
        self.credentials.set_session_token(token);
    }

    /// Returns the current session token, if one is set.
    pub fn session_token(&self) -> Option<String> {
        self.credentials.session_token()
    }

    /// Checks if a session token is currently set.
    ///
    /// This is a convenience method equivalent to `parse.session_token().is_some()`.
    pub fn is_authenticated(&self) -> bool {
        self.session_token().is_some()
    }

    pub fn set_installation_id(&self, installation_id: Option<String>) {
        self.credentials.set_installation_id(installation_id);
    }

    pub fn installation_id(&self) -> Option<String> {
        self.credentials.installation_id()
    }

    /// Builds the configuration of a LiveQuery client for this server.
    pub fn live_query_config(&self) -> Result<LiveQueryConfig, ParseError> {
        let url = match &self.live_query_server_url {
            Some(url) => url.clone(),
            None => websocket_url(&self.server_url)?,
        };

        let mut config = LiveQueryConfig::new(url.as_str(), &self.app_id)?
            .with_max_connection_attempts(self.max_connection_attempts)
            .with_connection_additional_properties(self.connection_additional_properties);
        config.client_key = self.client_key.clone();
        config.master_key = self.master_key.clone();
        config.maintenance_key = self.maintenance_key.clone();
        Ok(config)
    }

    /// Creates a LiveQuery client for this server. The client is not connected yet;
    /// call [`ParseLiveQuery::open`].
    pub fn live_query(&self) -> Result<ParseLiveQuery, ParseError> {
        Ok(ParseLiveQuery::new(
            self.live_query_config()?,
            self.credentials.clone(),
        ))
    }
}

impl CredentialsProvider for Parse {
    fn installation_id(&self) -> Option<String> {
        self.credentials.installation_id()
    }

    fn session_token(&self) -> Option<String> {
        self.credentials.session_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_query_url_follows_server_url() {
        let parse = Parse::new("https://example.com/parse/", "app", None, None).unwrap();
        assert_eq!(parse.server_url, "https://example.com/parse");

        let config = parse.live_query_config().unwrap();
        assert_eq!(config.server_url.as_str(), "wss://example.com/parse");
        assert_eq!(config.application_id, "app");
    }

    #[test]
    fn test_scheme_is_added_when_missing() {
        let parse = Parse::new("localhost:1337/parse", "app", Some("client"), None).unwrap();
        assert_eq!(parse.server_url, "http://localhost:1337/parse");
        let config = parse.live_query_config().unwrap();
        assert_eq!(config.server_url.as_str(), "ws://localhost:1337/parse");
        assert_eq!(config.client_key.as_deref(), Some("client"));
    }

    #[test]
    fn test_rejects_empty_app_id() {
        assert!(matches!(
            Parse::new("http://localhost:1337", "", None, None),
            Err(ParseError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_credentials_are_shared_between_clones() {
        let parse = Parse::new("http://localhost:1337", "app", None, None).unwrap();
        let clone = parse.clone();
        assert!(!clone.is_authenticated());

        parse.set_session_token(Some("r:token".to_string()));
        parse.set_installation_id(Some("install".to_string()));

        assert_eq!(clone.session_token().as_deref(), Some("r:token"));
        assert_eq!(
            CredentialsProvider::installation_id(&clone).as_deref(),
            Some("install")
        );
    }

    #[test]
    fn test_live_query_config_carries_settings() {
        let parse = Parse::new("http://localhost:1337", "app", None, Some("master"))
            .unwrap()
            .with_maintenance_key("maintenance")
            .with_max_connection_attempts(3)
            .with_connection_additional_properties(false);
        let config = parse.live_query_config().unwrap();
        assert_eq!(config.master_key.as_deref(), Some("master"));
        assert_eq!(config.maintenance_key.as_deref(), Some("maintenance"));
        assert_eq!(config.max_connection_attempts, 3);
        assert!(!config.connection_additional_properties);
    }
}
