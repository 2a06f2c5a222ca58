//! Typed query filters.
//!
//! A filter value is one of three shapes on the wire: a list (`IN`), an
//! `{ "operator": ..., "value": ... }` object (comparison) or any other scalar
//! (equality). [`Filter`] keeps those shapes as checked variants.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::DomainError;
use super::types::Record;

/// Comparison operators accepted in `{operator, value}` filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    Is,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Neq => "neq",
            CmpOp::Gt => "gt",
            CmpOp::Gte => "gte",
            CmpOp::Lt => "lt",
            CmpOp::Lte => "lte",
            CmpOp::Like => "like",
            CmpOp::Ilike => "ilike",
            CmpOp::Is => "is",
        }
    }

    /// SQL operator used by the Postgres query builder.
    pub fn as_sql(self) -> &'static str {
        match self {
            CmpOp::Eq => " = ",
            CmpOp::Neq => " <> ",
            CmpOp::Gt => " > ",
            CmpOp::Gte => " >= ",
            CmpOp::Lt => " < ",
            CmpOp::Lte => " <= ",
            CmpOp::Like => " LIKE ",
            CmpOp::Ilike => " ILIKE ",
            CmpOp::Is => " IS ",
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CmpOp {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "eq" => Ok(CmpOp::Eq),
            "neq" => Ok(CmpOp::Neq),
            "gt" => Ok(CmpOp::Gt),
            "gte" => Ok(CmpOp::Gte),
            "lt" => Ok(CmpOp::Lt),
            "lte" => Ok(CmpOp::Lte),
            "like" => Ok(CmpOp::Like),
            "ilike" => Ok(CmpOp::Ilike),
            "is" => Ok(CmpOp::Is),
            other => Err(DomainError::UnknownOperator(other.to_string())),
        }
    }
}

/// A single column constraint.
///
/// Variant order matters for untagged decoding: lists first, then operator
/// objects, then plain equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    In(Vec<Value>),
    Cmp { operator: CmpOp, value: Value },
    Eq(Value),
}

impl Filter {
    pub fn eq(value: impl Into<Value>) -> Self {
        Filter::Eq(value.into())
    }

    pub fn any_of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In(values.into_iter().map(Into::into).collect())
    }

    pub fn cmp(operator: CmpOp, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            operator,
            value: value.into(),
        }
    }

    /// Evaluate the filter against a column value; `None` means the column is absent.
    pub fn matches(&self, candidate: Option<&Value>) -> bool {
        let candidate = candidate.unwrap_or(&Value::Null);
        match self {
            Filter::Eq(expected) => loose_eq(candidate, expected),
            Filter::In(options) => options.iter().any(|option| loose_eq(candidate, option)),
            Filter::Cmp { operator, value } => match operator {
                CmpOp::Eq => loose_eq(candidate, value),
                CmpOp::Neq => !loose_eq(candidate, value),
                CmpOp::Gt => compare(candidate, value) == Some(Ordering::Greater),
                CmpOp::Gte => matches!(
                    compare(candidate, value),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
                CmpOp::Lt => compare(candidate, value) == Some(Ordering::Less),
                CmpOp::Lte => matches!(
                    compare(candidate, value),
                    Some(Ordering::Less | Ordering::Equal)
                ),
                CmpOp::Like => like(candidate, value, false),
                CmpOp::Ilike => like(candidate, value, true),
                CmpOp::Is => match value {
                    Value::Null => candidate.is_null(),
                    other => loose_eq(candidate, other),
                },
            },
        }
    }
}

/// Column filters keyed by column name.
///
/// Backed by a `BTreeMap` so iteration (and therefore generated SQL and cache
/// key material) is independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filters(BTreeMap<String, Filter>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, filter: Filter) -> Self {
        self.0.insert(column.into(), filter);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, filter: Filter) {
        self.0.insert(column.into(), filter);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Filter)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when every filter accepts the record.
    pub fn matches(&self, record: &Record) -> bool {
        self.0
            .iter()
            .all(|(column, filter)| filter.matches(record.get(column)))
    }

    /// Equality-only string form used by change-feed subscriptions:
    /// `column=eq.value` pairs joined by commas, or `*` when empty.
    pub fn to_feed_filter(&self) -> String {
        let parts: Vec<String> = self
            .0
            .iter()
            .filter_map(|(column, filter)| match filter {
                Filter::Eq(value)
                | Filter::Cmp {
                    operator: CmpOp::Eq,
                    value,
                } => Some(format!("{column}=eq.{}", scalar_text(value))),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            "*".to_string()
        } else {
            parts.join(",")
        }
    }
}

impl FromIterator<(String, Filter)> for Filters {
    fn from_iter<T: IntoIterator<Item = (String, Filter)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Sort order for a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// Parameters of a `select` against one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<Order>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter(mut self, column: impl Into<String>, filter: Filter) -> Self {
        self.filters.insert(column, filter);
        self
    }

    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Reject anything that is not a plain SQL identifier.
pub fn validate_identifier(name: &str) -> Result<(), DomainError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') || name.len() > 63 {
        return Err(DomainError::validation(format!(
            "`{name}` is not a valid identifier"
        )));
    }
    Ok(())
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(a), Value::Number(b)) | (Value::Number(b), Value::String(a)) => {
            a.parse::<f64>().ok() == b.as_f64()
        }
        _ => left == right,
    }
}

pub(crate) fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn like(candidate: &Value, pattern: &Value, case_insensitive: bool) -> bool {
    let (Value::String(text), Value::String(pattern)) = (candidate, pattern) else {
        return false;
    };
    if case_insensitive {
        like_match(&text.to_lowercase(), &pattern.to_lowercase())
    } else {
        like_match(text, pattern)
    }
}

/// SQL `LIKE` semantics: `%` matches any run, `_` matches one character.
fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_the_three_wire_shapes() {
        let filters: Filters = serde_json::from_value(json!({
            "status": ["open", "pending"],
            "created_at": {"operator": "gte", "value": "2024-01-01"},
            "user_id": 42
        }))
        .expect("decode filters");

        let mut iter = filters.iter();
        assert!(matches!(iter.next(), Some((c, Filter::Cmp { operator: CmpOp::Gte, .. })) if c == "created_at"));
        assert!(matches!(iter.next(), Some((c, Filter::In(v))) if c == "status" && v.len() == 2));
        assert!(matches!(iter.next(), Some((c, Filter::Eq(_))) if c == "user_id"));
    }

    #[test]
    fn object_without_operator_is_equality() {
        let filter: Filter = serde_json::from_value(json!({"nested": true})).expect("decode");
        assert!(matches!(filter, Filter::Eq(_)));
    }

    #[test]
    fn unknown_operator_is_rejected_by_parser() {
        assert!("between".parse::<CmpOp>().is_err());
        assert_eq!("ilike".parse::<CmpOp>().ok(), Some(CmpOp::Ilike));
    }

    #[test]
    fn matching_follows_sql_semantics() {
        let record: Record = json!({"name": "Alice", "age": 31, "team": "red"})
            .as_object()
            .cloned()
            .expect("object");

        assert!(Filters::new().with("age", Filter::cmp(CmpOp::Gte, 31)).matches(&record));
        assert!(!Filters::new().with("age", Filter::cmp(CmpOp::Gt, 31)).matches(&record));
        assert!(Filters::new().with("name", Filter::cmp(CmpOp::Ilike, "al%")).matches(&record));
        assert!(!Filters::new().with("name", Filter::cmp(CmpOp::Like, "al%")).matches(&record));
        assert!(Filters::new().with("team", Filter::any_of(["red", "blue"])).matches(&record));
        assert!(Filters::new().with("missing", Filter::cmp(CmpOp::Is, Value::Null)).matches(&record));
        assert!(Filters::new().with("age", Filter::eq("31")).matches(&record));
    }

    #[test]
    fn like_handles_single_character_wildcard() {
        assert!(like_match("chat-1", "chat-_"));
        assert!(!like_match("chat-10", "chat-_"));
        assert!(like_match("anything", "%"));
    }

    #[test]
    fn feed_filter_string_uses_equality_pairs() {
        let filters = Filters::new()
            .with("user_id", Filter::eq("u1"))
            .with("account_id", Filter::eq(9))
            .with("age", Filter::cmp(CmpOp::Gt, 3));
        assert_eq!(filters.to_feed_filter(), "account_id=eq.9,user_id=eq.u1");
        assert_eq!(Filters::new().to_feed_filter(), "*");
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("chat_messages").is_ok());
        assert!(validate_identifier("1chats").is_err());
        assert!(validate_identifier("chats; drop table x").is_err());
        assert!(validate_identifier("").is_err());
    }
}
