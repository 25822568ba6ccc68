// src/object.rs

use crate::types::date::ParseDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A schemaless Parse object, the default payload type of LiveQuery events.
///
/// Applications with a fixed schema can subscribe with their own `Deserialize` type
/// instead; `ParseObject` keeps every field the server sent in `fields`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParseObject {
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "className")]
    pub class_name: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "objectId")]
    pub object_id: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "createdAt"
    )]
    pub created_at: Option<ParseDate>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "updatedAt"
    )]
    pub updated_at: Option<ParseDate>,
    #[serde(rename = "ACL", skip_serializing_if = "Option::is_none")]
    pub acl: Option<Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ParseObject {
    pub fn new(class_name: &str) -> Self {
        ParseObject {
            class_name: class_name.to_string(),
            object_id: None,
            created_at: None,
            updated_at: None,
            acl: None,
            fields: Map::new(),
        }
    }

    pub fn get_object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    pub fn set<T: Serialize>(&mut self, field_name: &str, value: T) -> Result<(), crate::ParseError> {
        self.fields
            .insert(field_name.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, field_name: &str) -> Option<T> {
        self.fields
            .get(field_name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_payload_decodes_into_parse_object() {
        let payload = json!({
            "className": "GameScore",
            "objectId": "abc123",
            "createdAt": "2024-01-01T00:00:00.000Z",
            "updatedAt": "2024-01-02T00:00:00.000Z",
            "points": 11,
            "player": "Ana"
        });

        let object: ParseObject = serde_json::from_value(payload).unwrap();
        assert_eq!(object.class_name, "GameScore");
        assert_eq!(object.get_object_id(), Some("abc123"));
        assert_eq!(object.get::<i64>("points"), Some(11));
        assert_eq!(object.get::<String>("player").as_deref(), Some("Ana"));
        assert!(object.updated_at.is_some());
        assert!(!object.fields.contains_key("objectId"));
    }

    #[test]
    fn test_set_then_get_field() {
        let mut object = ParseObject::new("GameScore");
        object.set("points", 5).unwrap();
        assert_eq!(object.get::<i32>("points"), Some(5));
        assert_eq!(object.get::<String>("points"), None);
    }
}
