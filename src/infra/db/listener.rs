//! Change feed over `LISTEN/NOTIFY`.
//!
//! Tables opt in with `SELECT datagate_watch_table('<table>')`; the installed
//! trigger publishes `{table, eventType, old, new}` on the change channel.

use async_trait::async_trait;
use futures::{StreamExt, future};
use sqlx::postgres::{PgListener, PgPool};
use tracing::{debug, info};

use super::util::map_sqlx_error;
use crate::application::repos::{ChangeSource, ChangeStream, RepoError};
use crate::domain::filter::validate_identifier;
use crate::domain::{ChangeEvent, Filters};

pub const DEFAULT_CHANNEL: &str = "datagate_changes";

#[derive(Clone)]
pub struct PgChangeSource {
    pool: PgPool,
    channel: String,
}

impl PgChangeSource {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Install the change trigger on `table`. Safe to repeat.
    pub async fn watch_table(&self, table: &str) -> Result<(), RepoError> {
        validate_identifier(table)?;
        sqlx::query("SELECT datagate_watch_table($1::text::regclass, $2)")
            .bind(table)
            .bind(&self.channel)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// Decode one notification payload, keeping it only if it belongs to `table`
/// and its current row image passes `filters`.
fn decode(payload: &str, table: &str, filters: &Filters) -> Option<Result<ChangeEvent, RepoError>> {
    let event: ChangeEvent = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(err) => {
            return Some(Err(RepoError::from_persistence(format!(
                "malformed change payload: {err}"
            ))));
        }
    };
    if event.table != table {
        return None;
    }
    if !event.current().is_some_and(|row| filters.matches(row)) {
        debug!(table, "Change filtered out");
        return None;
    }
    Some(Ok(event))
}

#[async_trait]
impl ChangeSource for PgChangeSource {
    async fn subscribe(&self, table: &str, filters: &Filters) -> Result<ChangeStream, RepoError> {
        validate_identifier(table)?;
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        listener
            .listen(&self.channel)
            .await
            .map_err(map_sqlx_error)?;
        info!(
            channel = %self.channel,
            table,
            filter = %filters.to_feed_filter(),
            "Listening for table changes"
        );

        let table = table.to_string();
        let filters = filters.clone();
        let stream = listener.into_stream().filter_map(move |notification| {
            let decoded = match notification {
                Ok(notification) => decode(notification.payload(), &table, &filters),
                Err(err) => Some(Err(map_sqlx_error(err))),
            };
            future::ready(decoded)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChangeKind, Filter};

    const PAYLOAD: &str = r#"{"table":"chats","eventType":"UPDATE","old":{"id":1,"user_id":"u1"},"new":{"id":1,"user_id":"u2"}}"#;

    #[test]
    fn decodes_matching_payload() {
        let event = decode(PAYLOAD, "chats", &Filters::new())
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, ChangeKind::Update);
        assert_eq!(event.record_id().as_deref(), Some("1"));
    }

    #[test]
    fn filters_use_current_row_image() {
        let filters = Filters::new().with("user_id", Filter::eq("u1"));
        assert!(decode(PAYLOAD, "chats", &filters).is_none());
        let filters = Filters::new().with("user_id", Filter::eq("u2"));
        assert!(decode(PAYLOAD, "chats", &filters).is_some());
    }

    #[test]
    fn other_tables_are_skipped_and_garbage_is_an_error() {
        assert!(decode(PAYLOAD, "messages", &Filters::new()).is_none());
        assert!(matches!(
            decode("not json", "chats", &Filters::new()),
            Some(Err(RepoError::Persistence(_)))
        ));
    }

    #[test]
    fn delete_payload_without_new_image() {
        let payload = r#"{"table":"chats","eventType":"DELETE","old":{"id":3},"new":null}"#;
        let event = decode(payload, "chats", &Filters::new()).unwrap().unwrap();
        assert_eq!(event.event_type, ChangeKind::Delete);
        assert!(event.after.is_none());
    }
}
