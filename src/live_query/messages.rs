// src/live_query/messages.rs

//! Wire messages of the Parse LiveQuery protocol.
//!
//! Outbound messages are plain structs; absent optional fields are skipped rather than
//! sent as `null`. Inbound messages decode once into the closed [`ServerResponse`] union,
//! so an `op` the SDK does not know fails at decode time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::types::RequestId;

/// The `op` of a client-to-server message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClientOperation {
    Connect,
    Subscribe,
    Unsubscribe,
    Update,
}

/// `connect` and `unsubscribe` messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StandardMessage {
    pub op: ClientOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl StandardMessage {
    pub fn unsubscribe(request_id: RequestId) -> Self {
        StandardMessage {
            op: ClientOperation::Unsubscribe,
            application_id: None,
            client_key: None,
            master_key: None,
            maintenance_key: None,
            session_token: None,
            installation_id: None,
            request_id: Some(request_id),
        }
    }
}

/// The `query` object of a subscribe or update message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeQuery {
    pub class_name: String,
    #[serde(rename = "where", default)]
    pub where_clause: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "fields")]
    pub keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch: Option<Vec<String>>,
}

/// `subscribe` and `update` messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeMessage {
    pub op: ClientOperation,
    pub request_id: RequestId,
    pub query: SubscribeQuery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

/// Encodes an outbound message as compact JSON with keys in alphabetical order.
pub fn encode<M: Serialize>(message: &M) -> Result<String, ParseError> {
    let value = sort_keys(serde_json::to_value(message)?);
    Ok(serde_json::to_string(&value)?)
}

// `Map` keeps insertion order when serde_json's `preserve_order` feature is enabled
// anywhere in the build, so keys are sorted here.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sort_keys(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResponse {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
}

/// Body of `subscribed` and `unsubscribed` acknowledgements.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub request_id: RequestId,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: i32,
    pub error: String,
    #[serde(default)]
    pub reconnect: bool,
    /// Set when the error concerns a single subscription rather than the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

/// Body of the `create`, `update`, `enter`, `leave` and `delete` events.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub request_id: RequestId,
    pub object: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RedirectResponse {
    pub url: String,
}

/// Every message the LiveQuery server can send, discriminated by `op`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerResponse {
    Connected(ConnectionResponse),
    Subscribed(SubscriptionResponse),
    Unsubscribed(SubscriptionResponse),
    Error(ErrorResponse),
    Create(EventResponse),
    Update(EventResponse),
    Enter(EventResponse),
    Leave(EventResponse),
    Delete(EventResponse),
    Redirect(RedirectResponse),
}

impl ServerResponse {
    pub fn decode(text: &str) -> Result<Self, ParseError> {
        serde_json::from_str(text).map_err(|e| {
            ParseError::JsonDeserializationFailed(format!(
                "undecodable LiveQuery message: {}",
                e
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    Enter,
    Leave,
    Delete,
}
