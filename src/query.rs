// src/query.rs

use serde::Serialize;
use serde_json::{Map, Value};

use crate::live_query::messages::SubscribeQuery;

/// Describes the objects a live query subscription watches.
///
/// A `ParseQuery` is a plain value: the class name, the `where` constraints, an optional
/// list of keys to return and an optional list of keys to watch. Two queries are the
/// same subscription target when all of those are equal, which is how
/// [`ParseLiveQuery::unsubscribe`](crate::live_query::ParseLiveQuery::unsubscribe) finds
/// the request to cancel.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseQuery {
    class_name: String,
    conditions: Map<String, Value>,
    keys: Option<Vec<String>>, // For selecting specific fields
    watch: Option<Vec<String>>, // Only fire update events when these fields change
    order: Option<String>,
}

impl ParseQuery {
    /// Creates a new `ParseQuery` for the specified class name.
    ///
    /// # Arguments
    /// * `class_name` - The name of the Parse class to watch.
    pub fn new(class_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            conditions: Map::new(),
            keys: None,
            watch: None,
            order: None,
        }
    }

    /// Returns the class name this query targets.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Returns the `where` constraints collected so far.
    pub fn conditions(&self) -> &Map<String, Value> {
        &self.conditions
    }

    pub fn keys(&self) -> Option<&[String]> {
        self.keys.as_deref()
    }

    pub fn watched_keys(&self) -> Option<&[String]> {
        self.watch.as_deref()
    }

    pub fn order_keys(&self) -> Option<&str> {
        self.order.as_deref()
    }

    // Helper to add a simple condition like "field": "value"
    fn add_simple_condition(&mut self, key: &str, value: Value) -> &mut Self {
        self.conditions.insert(key.to_string(), value);
        self
    }

    // Helper to add an operator condition like "field": {"$op": "value"}.
    // Several operators on the same field are merged into one object.
    fn add_operator_condition(&mut self, key: &str, operator: &str, value: Value) -> &mut Self {
        match self.conditions.get_mut(key) {
            Some(Value::Object(existing)) => {
                existing.insert(operator.to_string(), value);
            }
            _ => {
                let mut op_map = Map::new();
                op_map.insert(operator.to_string(), value);
                self.conditions
                    .insert(key.to_string(), Value::Object(op_map));
            }
        }
        self
    }

    fn add_serialized_operator<V: Serialize>(
        &mut self,
        key: &str,
        operator: &str,
        value: V,
    ) -> &mut Self {
        match serde_json::to_value(value) {
            Ok(json_val) => self.add_operator_condition(key, operator, json_val),
            Err(e) => {
                log::warn!(
                    "Dropping '{}' constraint on '{}': value is not serializable: {}",
                    operator,
                    key,
                    e
                );
                self
            }
        }
    }

    /// Adds a constraint to the query that a field must be equal to a specified value.
    pub fn equal_to<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        match serde_json::to_value(value) {
            Ok(json_val) => self.add_simple_condition(key, json_val),
            Err(e) => {
                log::warn!("Dropping equality constraint on '{}': {}", key, e);
                self
            }
        }
    }

    /// Adds a constraint to the query that a field must not be equal to a specified value.
    pub fn not_equal_to<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        self.add_serialized_operator(key, "$ne", value)
    }

    /// Adds a constraint to the query that a field must exist.
    pub fn exists(&mut self, key: &str) -> &mut Self {
        self.add_operator_condition(key, "$exists", Value::Bool(true))
    }

    /// Adds a constraint to the query that a field must not exist.
    pub fn does_not_exist(&mut self, key: &str) -> &mut Self {
        self.add_operator_condition(key, "$exists", Value::Bool(false))
    }

    /// Adds a constraint for finding objects where a field's value is greater than the provided value.
    pub fn greater_than<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        self.add_serialized_operator(key, "$gt", value)
    }

    /// Adds a constraint for finding objects where a field's value is greater than or equal to the provided value.
    pub fn greater_than_or_equal_to<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        self.add_serialized_operator(key, "$gte", value)
    }

    /// Adds a constraint for finding objects where a field's value is less than the provided value.
    pub fn less_than<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        self.add_serialized_operator(key, "$lt", value)
    }

    /// Adds a constraint for finding objects where a field's value is less than or equal to the provided value.
    pub fn less_than_or_equal_to<V: Serialize>(&mut self, key: &str, value: V) -> &mut Self {
        self.add_serialized_operator(key, "$lte", value)
    }

    /// Adds a constraint for finding objects where a field's value is contained in the provided list of values.
    pub fn contained_in<V: Serialize>(&mut self, key: &str, values: Vec<V>) -> &mut Self {
        self.add_serialized_operator(key, "$in", values)
    }

    /// Adds a constraint for finding objects where a field's value is not contained in the provided list of values.
    pub fn not_contained_in<V: Serialize>(&mut self, key: &str, values: Vec<V>) -> &mut Self {
        self.add_serialized_operator(key, "$nin", values)
    }

    /// Adds a constraint for finding objects where a field contains all of the provided values (for array fields).
    pub fn contains_all<V: Serialize>(&mut self, key: &str, values: Vec<V>) -> &mut Self {
        self.add_serialized_operator(key, "$all", values)
    }

    /// Adds a constraint for finding objects where a string field starts with a given prefix.
    pub fn starts_with(&mut self, key: &str, prefix: &str) -> &mut Self {
        self.add_operator_condition(
            key,
            "$regex",
            Value::String(format!("^{}", regex::escape(prefix))),
        )
    }

    /// Adds a constraint for finding objects where a string field ends with a given suffix.
    pub fn ends_with(&mut self, key: &str, suffix: &str) -> &mut Self {
        self.add_operator_condition(
            key,
            "$regex",
            Value::String(format!("{}$", regex::escape(suffix))),
        )
    }

    /// Adds a constraint for finding objects where a string field contains a given substring.
    pub fn contains(&mut self, key: &str, substring: &str) -> &mut Self {
        self.add_operator_condition(
            key,
            "$regex",
            Value::String(format!(".*{}.*", regex::escape(substring))),
        )
    }

    /// Adds a constraint for finding objects where a string field matches a given regex pattern.
    /// Modifiers can be 'i' for case-insensitive, 'm' for multiline, etc.
    pub fn matches_regex(
        &mut self,
        key: &str,
        regex_pattern: &str,
        modifiers: Option<&str>,
    ) -> &mut Self {
        let mut regex_map = Map::new();
        regex_map.insert(
            "$regex".to_string(),
            Value::String(regex_pattern.to_string()),
        );
        if let Some(mods) = modifiers {
            regex_map.insert("$options".to_string(), Value::String(mods.to_string()));
        }
        self.conditions
            .insert(key.to_string(), Value::Object(regex_map));
        self
    }

    /// Restricts the fields sent back in event objects.
    pub fn select(&mut self, keys_to_select: &[&str]) -> &mut Self {
        let keys = self.keys.get_or_insert_with(Vec::new);
        extend_sorted_unique(keys, keys_to_select);
        self
    }

    /// Only emits `update` events when one of the given keys changes.
    pub fn watch(&mut self, keys_to_watch: &[&str]) -> &mut Self {
        let watch = self.watch.get_or_insert_with(Vec::new);
        extend_sorted_unique(watch, keys_to_watch);
        self
    }

    /// Sorts by a given key in ascending order. Replaces any existing sort order.
    ///
    /// The LiveQuery server ignores ordering; it is kept so a descriptor can be shared
    /// with code that also runs the query over REST.
    pub fn order_by_ascending(&mut self, key: &str) -> &mut Self {
        self.order = Some(key.to_string());
        self
    }

    /// Sorts by a given key in descending order. Replaces any existing sort order.
    pub fn order_by_descending(&mut self, key: &str) -> &mut Self {
        self.order = Some(format!("-{}", key));
        self
    }

    /// Builds the `query` object carried by `subscribe` and `update` messages.
    pub fn to_subscribe_query(&self) -> SubscribeQuery {
        SubscribeQuery {
            class_name: self.class_name.clone(),
            where_clause: self.conditions.clone(),
            keys: self.keys.clone(),
            watch: self.watch.clone(),
        }
    }
}

fn extend_sorted_unique(target: &mut Vec<String>, additions: &[&str]) {
    target.extend(additions.iter().map(|key| key.to_string()));
    target.sort_unstable();
    target.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_conditions_on_same_key_are_merged() {
        let mut query = ParseQuery::new("GameScore");
        query.greater_than("points", 9).less_than("points", 100);

        assert_eq!(
            Value::Object(query.conditions().clone()),
            json!({ "points": { "$gt": 9, "$lt": 100 } })
        );
    }

    #[test]
    fn test_equal_to_replaces_operator_condition() {
        let mut query = ParseQuery::new("GameScore");
        query.exists("name").equal_to("name", "Ana");
        assert_eq!(query.conditions().get("name"), Some(&json!("Ana")));
    }

    #[test]
    fn test_select_and_watch_are_sorted_and_deduplicated() {
        let mut query = ParseQuery::new("GameScore");
        query.select(&["score", "name"]).select(&["name"]);
        query.watch(&["score"]);

        assert_eq!(
            query.keys(),
            Some(&["name".to_string(), "score".to_string()][..])
        );
        assert_eq!(query.watched_keys(), Some(&["score".to_string()][..]));
    }

    #[test]
    fn test_starts_with_escapes_regex() {
        let mut query = ParseQuery::new("Post");
        query.starts_with("title", "a.b");
        assert_eq!(
            query.conditions().get("title"),
            Some(&json!({ "$regex": "^a\\.b" }))
        );
    }

    #[test]
    fn test_queries_with_same_constraints_are_equal() {
        let mut first = ParseQuery::new("GameScore");
        first.greater_than("points", 9);
        let mut second = ParseQuery::new("GameScore");
        second.greater_than("points", 9);
        assert_eq!(first, second);

        second.watch(&["points"]);
        assert_ne!(first, second);
    }

    #[test]
    fn test_to_subscribe_query_carries_selectors() {
        let mut query = ParseQuery::new("GameScore");
        query.equal_to("player", "Ana").select(&["score"]).watch(&["score"]);
        query.order_by_descending("score");

        let subscribe = query.to_subscribe_query();
        assert_eq!(subscribe.class_name, "GameScore");
        assert_eq!(subscribe.keys, Some(vec!["score".to_string()]));
        assert_eq!(subscribe.watch, Some(vec!["score".to_string()]));
        assert_eq!(query.order_keys(), Some("-score"));
    }
}
