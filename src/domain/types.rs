//! Row and change-event shapes exchanged with the relational store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single row as returned by the relational store.
pub type Record = Map<String, Value>;

/// Row-level change type delivered by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// A row change observed on a table.
///
/// Consumed once by the change-feed pipeline and then dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: String,
    pub event_type: ChangeKind,
    #[serde(default, alias = "old", skip_serializing_if = "Option::is_none")]
    pub before: Option<Record>,
    #[serde(default, alias = "new", skip_serializing_if = "Option::is_none")]
    pub after: Option<Record>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, after: Record) -> Self {
        Self {
            table: table.into(),
            event_type: ChangeKind::Insert,
            before: None,
            after: Some(after),
        }
    }

    pub fn update(table: impl Into<String>, before: Option<Record>, after: Record) -> Self {
        Self {
            table: table.into(),
            event_type: ChangeKind::Update,
            before,
            after: Some(after),
        }
    }

    pub fn delete(table: impl Into<String>, before: Record) -> Self {
        Self {
            table: table.into(),
            event_type: ChangeKind::Delete,
            before: Some(before),
            after: None,
        }
    }

    /// The row image that identifies the affected record: `after` for
    /// inserts/updates, `before` for deletes.
    pub fn current(&self) -> Option<&Record> {
        match self.event_type {
            ChangeKind::Delete => self.before.as_ref(),
            ChangeKind::Insert | ChangeKind::Update => self.after.as_ref().or(self.before.as_ref()),
        }
    }

    /// Identifier of the affected record, if the row image carries an `id`.
    pub fn record_id(&self) -> Option<String> {
        self.current().and_then(record_id)
    }
}

/// Render a record's `id` column as a cache-key segment.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Record {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn delete_identifies_record_from_before_image() {
        let event = ChangeEvent::delete("chats", row(json!({"id": 7, "title": "x"})));
        assert_eq!(event.record_id().as_deref(), Some("7"));
    }

    #[test]
    fn update_prefers_after_image() {
        let event = ChangeEvent::update(
            "chats",
            Some(row(json!({"id": "old"}))),
            row(json!({"id": "new"})),
        );
        assert_eq!(event.record_id().as_deref(), Some("new"));
    }

    #[test]
    fn decodes_wire_payload_with_old_new_aliases() {
        let payload = json!({
            "table": "messages",
            "eventType": "UPDATE",
            "old": {"id": 1, "body": "a"},
            "new": {"id": 1, "body": "b"}
        });
        let event: ChangeEvent = serde_json::from_value(payload).expect("decode change");
        assert_eq!(event.event_type, ChangeKind::Update);
        assert_eq!(event.after.as_ref().and_then(|r| r.get("body")), Some(&json!("b")));
    }

    #[test]
    fn record_without_id_has_no_key() {
        let event = ChangeEvent::insert("chats", row(json!({"title": "x"})));
        assert!(event.record_id().is_none());
    }
}
