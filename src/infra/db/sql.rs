//! SQL assembly for table-generic statements.
//!
//! Identifiers are validated and quoted; every value is bound. Filter values
//! arrive as JSON, so they are cast to the column's own type by routing them
//! through `jsonb_populate_record(NULL::<table>, ...)`.

use serde_json::{Map, Value};
use sqlx::{Postgres, QueryBuilder, types::Json};

use crate::application::repos::RepoError;
use crate::domain::filter::validate_identifier;
use crate::domain::{CmpOp, Filter, Filters, Order, Record, SelectQuery};

/// Alias every statement gives the target table.
const ALIAS: &str = "t";

pub(super) fn quoted(name: &str) -> Result<String, RepoError> {
    validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

pub(super) fn build_select(
    table: &str,
    query: &SelectQuery,
) -> Result<QueryBuilder<'static, Postgres>, RepoError> {
    let target = quoted(table)?;
    let mut qb = QueryBuilder::new("SELECT ");
    match query.columns.as_deref() {
        Some(columns) if !columns.is_empty() => {
            qb.push("jsonb_build_object(");
            for (index, column) in columns.iter().enumerate() {
                let column_ident = quoted(column)?;
                if index > 0 {
                    qb.push(", ");
                }
                qb.push(format!("'{column}', {ALIAS}.{column_ident}"));
            }
            qb.push(")");
        }
        _ => {
            qb.push(format!("to_jsonb({ALIAS})"));
        }
    }
    qb.push(format!(" FROM {target} AS {ALIAS}"));
    push_filters(&mut qb, &target, &query.filters)?;
    push_order(&mut qb, &query.order)?;
    if let Some(limit) = query.limit {
        qb.push(" LIMIT ");
        qb.push_bind(to_i64(limit)?);
    }
    if let Some(offset) = query.offset {
        qb.push(" OFFSET ");
        qb.push_bind(to_i64(offset)?);
    }
    Ok(qb)
}

pub(super) fn build_count(
    table: &str,
    filters: &Filters,
) -> Result<QueryBuilder<'static, Postgres>, RepoError> {
    let target = quoted(table)?;
    let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {target} AS {ALIAS}"));
    push_filters(&mut qb, &target, filters)?;
    Ok(qb)
}

/// Split `rows` into consecutive runs that carry the same column set. Each
/// run becomes one statement, so a column missing from a row is never sent
/// as an explicit NULL.
pub(super) fn column_runs(rows: &[Record]) -> Vec<&[Record]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for end in 1..=rows.len() {
        if end == rows.len() || !same_columns(&rows[end - 1], &rows[end]) {
            runs.push(&rows[start..end]);
            start = end;
        }
    }
    runs
}

fn same_columns(left: &Record, right: &Record) -> bool {
    left.len() == right.len() && left.keys().all(|column| right.contains_key(column))
}

/// `INSERT ... SELECT` over `jsonb_populate_recordset`, listing only the
/// columns present in `rows` so table defaults apply to the rest.
///
/// Rows should share one column set (see [`column_runs`]); a column present
/// in only some rows is inserted as NULL for the others.
pub(super) fn build_insert(
    table: &str,
    rows: &[Record],
) -> Result<QueryBuilder<'static, Postgres>, RepoError> {
    let target = quoted(table)?;
    let mut columns: Vec<&String> = rows.iter().flat_map(|row| row.keys()).collect();
    columns.sort();
    columns.dedup();
    if columns.is_empty() {
        return Err(RepoError::invalid_input("insert requires at least one column"));
    }
    let column_list = columns
        .iter()
        .map(|column| quoted(column))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {target} AS {ALIAS} ({column_list}) SELECT {column_list} FROM jsonb_populate_recordset(NULL::{target}, "
    ));
    qb.push_bind(Json(payload));
    qb.push(format!(") RETURNING to_jsonb({ALIAS})"));
    Ok(qb)
}

pub(super) fn build_update(
    table: &str,
    changes: &Record,
    filters: &Filters,
) -> Result<QueryBuilder<'static, Postgres>, RepoError> {
    if changes.is_empty() {
        return Err(RepoError::invalid_input("update requires at least one column"));
    }
    let target = quoted(table)?;
    let assignments = changes
        .keys()
        .map(|column| quoted(column).map(|ident| format!("{ident} = src.{ident}")))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let mut qb = QueryBuilder::new(format!("UPDATE {target} AS {ALIAS} SET {assignments} FROM jsonb_populate_record(NULL::{target}, "));
    qb.push_bind(Json(Value::Object(changes.clone())));
    qb.push(") AS src");
    push_filters(&mut qb, &target, filters)?;
    qb.push(format!(" RETURNING to_jsonb({ALIAS})"));
    Ok(qb)
}

pub(super) fn build_delete(
    table: &str,
    filters: &Filters,
) -> Result<QueryBuilder<'static, Postgres>, RepoError> {
    let target = quoted(table)?;
    let mut qb = QueryBuilder::new(format!("DELETE FROM {target} AS {ALIAS}"));
    push_filters(&mut qb, &target, filters)?;
    qb.push(format!(" RETURNING to_jsonb({ALIAS})"));
    Ok(qb)
}

fn push_filters(
    qb: &mut QueryBuilder<'static, Postgres>,
    target: &str,
    filters: &Filters,
) -> Result<(), RepoError> {
    let mut first = true;
    for (column, filter) in filters.iter() {
        let ident = quoted(column)?;
        qb.push(if first { " WHERE " } else { " AND " });
        first = false;
        push_condition(qb, target, column, &ident, filter);
    }
    Ok(())
}

fn push_condition(
    qb: &mut QueryBuilder<'static, Postgres>,
    target: &str,
    column: &str,
    ident: &str,
    filter: &Filter,
) {
    let lhs = format!("{ALIAS}.{ident}");
    match filter {
        Filter::Eq(value) => push_typed_comparison(qb, target, column, ident, &lhs, CmpOp::Eq, value),
        Filter::In(values) if values.is_empty() => {
            qb.push("FALSE");
        }
        Filter::In(values) => {
            qb.push(format!(
                "{lhs} IN (SELECT (jsonb_populate_record(NULL::{target}, jsonb_build_object('{column}', v))).{ident} FROM jsonb_array_elements("
            ));
            qb.push_bind(Json(Value::Array(values.clone())));
            qb.push(") AS v)");
        }
        Filter::Cmp { operator, value } => match (operator, value) {
            (CmpOp::Like | CmpOp::Ilike, pattern) => {
                qb.push(format!("{lhs}::text{}", operator.as_sql()));
                qb.push_bind(match pattern {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                });
            }
            (CmpOp::Is, Value::Null) => {
                qb.push(format!("{lhs} IS NULL"));
            }
            (CmpOp::Is, Value::Bool(flag)) => {
                qb.push(format!("{lhs} IS {}", if *flag { "TRUE" } else { "FALSE" }));
            }
            (CmpOp::Is, other) => {
                push_typed_comparison(qb, target, column, ident, &lhs, CmpOp::Eq, other)
            }
            (operator, value) => {
                push_typed_comparison(qb, target, column, ident, &lhs, *operator, value)
            }
        },
    }
}

fn push_typed_comparison(
    qb: &mut QueryBuilder<'static, Postgres>,
    target: &str,
    column: &str,
    ident: &str,
    lhs: &str,
    operator: CmpOp,
    value: &Value,
) {
    let mut wrapper = Map::with_capacity(1);
    wrapper.insert(column.to_string(), value.clone());
    qb.push(format!(
        "{lhs}{}(jsonb_populate_record(NULL::{target}, ",
        operator.as_sql()
    ));
    qb.push_bind(Json(Value::Object(wrapper)));
    qb.push(format!(")).{ident}"));
}

fn push_order(qb: &mut QueryBuilder<'static, Postgres>, order: &[Order]) -> Result<(), RepoError> {
    for (index, order) in order.iter().enumerate() {
        let ident = quoted(&order.column)?;
        qb.push(if index == 0 { " ORDER BY " } else { ", " });
        qb.push(format!(
            "{ALIAS}.{ident} {}",
            if order.ascending { "ASC" } else { "DESC" }
        ));
    }
    Ok(())
}

fn to_i64(value: u64) -> Result<i64, RepoError> {
    i64::try_from(value).map_err(|_| RepoError::invalid_input("limit or offset out of range"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn select_with_filters_order_and_paging() {
        let query = SelectQuery::new()
            .columns(["id", "title"])
            .filter("user_id", Filter::eq("u1"))
            .filter("created_at", Filter::cmp(CmpOp::Gte, "2024-01-01"))
            .order(Order::desc("created_at"))
            .limit(20)
            .offset(40);
        let qb = build_select("chats", &query).unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT jsonb_build_object('id', t.\"id\", 'title', t.\"title\") FROM \"chats\" AS t \
             WHERE t.\"created_at\" >= (jsonb_populate_record(NULL::\"chats\", $1)).\"created_at\" \
             AND t.\"user_id\" = (jsonb_populate_record(NULL::\"chats\", $2)).\"user_id\" \
             ORDER BY t.\"created_at\" DESC LIMIT $3 OFFSET $4"
        );
    }

    #[test]
    fn in_and_null_filters() {
        let filters = Filters::new()
            .with("status", Filter::any_of(["open", "closed"]))
            .with("archived_at", Filter::cmp(CmpOp::Is, Value::Null));
        let qb = build_count("chats", &filters).unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT COUNT(*) FROM \"chats\" AS t WHERE t.\"archived_at\" IS NULL \
             AND t.\"status\" IN (SELECT (jsonb_populate_record(NULL::\"chats\", jsonb_build_object('status', v))).\"status\" FROM jsonb_array_elements($1) AS v)"
        );
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let filters = Filters::new().with("id", Filter::In(Vec::new()));
        let qb = build_delete("chats", &filters).unwrap();
        assert_eq!(
            qb.sql(),
            "DELETE FROM \"chats\" AS t WHERE FALSE RETURNING to_jsonb(t)"
        );
    }

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn rows_are_split_into_runs_of_equal_columns() {
        let rows = vec![
            row(json!({"title": "a"})),
            row(json!({"title": "b"})),
            row(json!({"title": "c", "user_id": "u1"})),
            row(json!({"user_id": "u2", "title": "d"})),
            row(json!({"title": "e"})),
        ];
        let runs: Vec<usize> = column_runs(&rows).iter().map(|run| run.len()).collect();
        assert_eq!(runs, vec![2, 2, 1]);
        assert!(column_runs(&[]).is_empty());
    }

    #[test]
    fn insert_lists_columns_of_the_run() {
        let rows = vec![
            row(json!({"title": "a", "user_id": "u1"})),
            row(json!({"title": "b", "user_id": "u1"})),
        ];
        let qb = build_insert("chats", &rows).unwrap();
        assert_eq!(
            qb.sql(),
            "INSERT INTO \"chats\" AS t (\"title\", \"user_id\") SELECT \"title\", \"user_id\" \
             FROM jsonb_populate_recordset(NULL::\"chats\", $1) RETURNING to_jsonb(t)"
        );
    }

    #[test]
    fn update_sets_from_populated_record() {
        let changes = json!({"title": "renamed"}).as_object().cloned().unwrap();
        let filters = Filters::new().with("id", Filter::eq(7));
        let qb = build_update("chats", &changes, &filters).unwrap();
        assert_eq!(
            qb.sql(),
            "UPDATE \"chats\" AS t SET \"title\" = src.\"title\" \
             FROM jsonb_populate_record(NULL::\"chats\", $1) AS src \
             WHERE t.\"id\" = (jsonb_populate_record(NULL::\"chats\", $2)).\"id\" RETURNING to_jsonb(t)"
        );
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let query = SelectQuery::new().filter("id; drop table x", Filter::eq(1));
        assert!(matches!(
            build_select("chats", &query),
            Err(RepoError::InvalidInput { .. })
        ));
        assert!(build_count("chats\"", &Filters::new()).is_err());
        assert!(build_update("chats", &Record::new(), &Filters::new()).is_err());
    }
}
