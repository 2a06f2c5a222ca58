//! Cache key generation.
//!
//! Keys are `prefix:base64(canonical-json(params))`. Canonical JSON sorts
//! object keys at every depth, so two parameter maps that are equal apart from
//! insertion order produce the same key.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::domain::{Filters, SelectQuery};

pub const QUERY_NAMESPACE: &str = "query";
pub const PAGINATION_NAMESPACE: &str = "pagination";
pub const RECORD_NAMESPACE: &str = "record";
pub const DASHBOARD_NAMESPACE: &str = "dashboard";
pub const STATS_NAMESPACE: &str = "stats";

/// Build a deterministic key from a prefix and any serializable parameter bag.
///
/// Parameters that fail to serialize are encoded as `null`, which still
/// yields a stable key.
pub fn make_key<P>(prefix: &str, params: &P) -> String
where
    P: Serialize + ?Sized,
{
    let value = serde_json::to_value(params).unwrap_or(Value::Null);
    let canonical = canonicalize(value);
    let encoded = STANDARD.encode(canonical.to_string());
    format!("{prefix}:{encoded}")
}

/// Rebuild a JSON value with object keys in lexicographic order.
///
/// Entries are inserted already sorted, so the result is ordered whether or
/// not `serde_json` preserves insertion order.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, inner) in entries {
                sorted.insert(key, canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Key for a cached `select` against `table`.
pub fn query_key(table: &str, query: &SelectQuery) -> String {
    make_key(&format!("{QUERY_NAMESPACE}:{table}"), query)
}

/// Key for a cached `count` against `table`.
pub fn count_key(table: &str, filters: &Filters) -> String {
    make_key(&format!("{QUERY_NAMESPACE}:{table}:count"), filters)
}

/// Key for a cached page of `base`.
pub fn pagination_key<P>(base: &str, params: &P) -> String
where
    P: Serialize + ?Sized,
{
    make_key(&format!("{PAGINATION_NAMESPACE}:{base}"), params)
}

/// Key for a single record written by the change feed.
pub fn record_key(table: &str, id: &str) -> String {
    format!("{RECORD_NAMESPACE}:{table}:{id}")
}

/// Glob matching every key of `namespace` that belongs to `table`.
pub fn table_pattern(namespace: &str, table: &str) -> String {
    format!("{namespace}:{table}:*")
}

/// Glob matching every key in `namespace`.
pub fn namespace_pattern(namespace: &str) -> String {
    format!("{namespace}:*")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::Filter;

    #[test]
    fn insertion_order_does_not_change_key() {
        let first = json!({"page": 1, "filters": {"b": 2, "a": {"y": 1, "x": 2}}});
        let mut reordered = Map::new();
        let mut inner = Map::new();
        inner.insert("a".into(), json!({"x": 2, "y": 1}));
        inner.insert("b".into(), json!(2));
        reordered.insert("filters".into(), Value::Object(inner));
        reordered.insert("page".into(), json!(1));

        assert_eq!(
            make_key("chats", &first),
            make_key("chats", &Value::Object(reordered))
        );
    }

    #[test]
    fn empty_params_encode_empty_object() {
        let key = make_key("chats", &json!({}));
        assert_eq!(key, format!("chats:{}", STANDARD.encode("{}")));
    }

    #[test]
    fn different_params_produce_different_keys() {
        assert_ne!(
            make_key("chats", &json!({"page": 1})),
            make_key("chats", &json!({"page": 2}))
        );
    }

    #[test]
    fn table_keys_fall_under_table_pattern() {
        let query = SelectQuery::new().filter("user_id", Filter::eq("u1"));
        let key = query_key("chats", &query);
        assert!(key.starts_with("query:chats:"));

        let count = count_key("chats", &Filters::new());
        assert!(count.starts_with("query:chats:count:"));
        assert_eq!(table_pattern(QUERY_NAMESPACE, "chats"), "query:chats:*");
    }

    #[test]
    fn record_and_pagination_keys() {
        assert_eq!(record_key("chats", "42"), "record:chats:42");
        assert!(pagination_key("chats", &json!({})).starts_with("pagination:chats:"));
        assert_eq!(namespace_pattern(DASHBOARD_NAMESPACE), "dashboard:*");
    }
}
