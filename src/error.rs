// src/error.rs
use thiserror::Error;

use crate::live_query::messages::ErrorResponse;
use crate::types::RequestId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("URL parsing failed: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON processing error: {0}")]
    JsonError(String),

    #[error("JSON deserialization failed: {0}")]
    JsonDeserializationFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid class name: {0}")]
    InvalidClassName(String),

    #[error("Invalid session token: {0}")]
    InvalidSessionToken(String),

    #[error("Operation forbidden: {0}")]
    OperationForbidden(String),

    #[error("SDK error: {0}")]
    SdkError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("LiveQuery socket is not connected")]
    NotConnected,

    #[error("LiveQuery has not been configured")]
    NotConfigured,

    #[error("Query not subscribed: {0}")]
    QueryNotSubscribed(String),

    #[error("Received a response for clientId {received:?} but this client is {expected:?}")]
    ClientIdMismatch {
        expected: Option<String>,
        received: String,
    },

    #[error("No pending subscription with requestId {0}")]
    UnknownRequestId(RequestId),

    #[error("Every LiveQuery request id of this client has been used")]
    RequestIdsExhausted,

    #[error("Reached the maximum of {0} LiveQuery connection attempts")]
    MaxConnectionAttempts(u32),

    #[error("LiveQuery server error (code {code}, reconnect: {reconnect}): {error}")]
    LiveQueryServerError {
        code: i32,
        error: String,
        reconnect: bool,
    },
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::JsonError(err.to_string())
    }
}

impl ParseError {
    /// Creates a `ParseError` from an `error` message pushed by the LiveQuery server.
    ///
    /// Codes the SDK knows how to name are mapped onto typed variants; everything else
    /// keeps the server's code, message and reconnect flag.
    pub fn from_live_query_error(response: &ErrorResponse) -> Self {
        let code = response.code;
        let message = response.error.clone();

        match code {
            100 => ParseError::ConnectionFailed(format!("({}) {}", code, message)),
            102 => ParseError::InvalidQuery(format!("({}) {}", code, message)),
            103 => ParseError::InvalidClassName(format!("({}) {}", code, message)),
            119 => ParseError::OperationForbidden(format!(
                "Missing master key for operation: ({}) {}",
                code, message
            )),
            209 => ParseError::InvalidSessionToken(format!("({}) {}", code, message)),
            _ => ParseError::LiveQueryServerError {
                code,
                error: message,
                reconnect: response.reconnect,
            },
        }
    }
}
