//! Route handlers. Each one is a thin adapter over the application services.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use datagate_api_types::SuccessBody;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::AppState;
use super::extract::{ApiPath, ApiQuery};
use crate::application::error::AppError;
use crate::application::gateway::TablePage;
use crate::application::monitor::{HealthRating, MonitorReport};
use crate::application::repos::RepoError;
use crate::cache::{CacheStats, Connectivity};
use crate::domain::{Filters, Order, Record};
use crate::realtime::{RegistryStats, SubscriptionInfo};

const DEFAULT_PAGE_SIZE: i64 = 20;

/// Query string of `GET /api/tables/{table}`.
///
/// `filters` is a JSON object in the filter wire shape, `order` is
/// `column.asc,other.desc`, `select` is a comma-separated column list.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TableListQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub filters: Option<String>,
    pub order: Option<String>,
    pub select: Option<String>,
}

impl TableListQuery {
    fn into_page(self) -> Result<TablePage, AppError> {
        let filters = match self.filters.as_deref().map(str::trim) {
            None | Some("") => Filters::new(),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|err| AppError::validation(format!("invalid filters: {err}")))?,
        };
        let order = match self.order.as_deref() {
            None => Vec::new(),
            Some(raw) => parse_order(raw)?,
        };
        let columns = self.select.as_deref().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|column| !column.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        Ok(TablePage {
            page: self.page.unwrap_or(1),
            page_size: self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            filters,
            order,
            columns: columns.filter(|columns| !columns.is_empty()),
        })
    }
}

fn parse_order(raw: &str) -> Result<Vec<Order>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.rsplit_once('.') {
            None => Ok(Order::asc(part)),
            Some((column, "asc")) => Ok(Order::asc(column)),
            Some((column, "desc")) => Ok(Order::desc(column)),
            Some((_, direction)) => Err(AppError::validation(format!(
                "unknown sort direction `{direction}`"
            ))),
        })
        .collect()
}

pub async fn list_table(
    State(state): State<AppState>,
    ApiPath(table): ApiPath<String>,
    ApiQuery(query): ApiQuery<TableListQuery>,
) -> Result<Json<SuccessBody<Vec<Record>>>, AppError> {
    let gateway = state.gateway.as_ref().ok_or(RepoError::Unconfigured)?;
    let request = query.into_page()?;
    let page = gateway.paginate(&table, &request).await?;

    Ok(Json(
        SuccessBody::new(page.items)
            .with_pagination(page.pagination)
            .with_cached(page.cached),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthBody {
    pub status: HealthRating,
    pub database: &'static str,
    pub cache: Connectivity,
    pub realtime: RegistryStats,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.gateway.as_ref() {
        None => "unconfigured",
        Some(gateway) => match gateway.relational().health_check().await {
            Ok(()) => "up",
            Err(err) => {
                warn!(error = %err, "Database health check failed");
                "down"
            }
        },
    };
    let status = if database == "down" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = HealthBody {
        status: state.monitor.health(),
        database,
        cache: state.cache.connectivity(),
        realtime: state.realtime.registry.stats(),
    };
    (status, Json(body))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsBody {
    #[serde(flatten)]
    pub report: MonitorReport,
    pub realtime: RegistryStats,
    pub subscriptions: Vec<SubscriptionInfo>,
}

pub async fn metrics(State(state): State<AppState>) -> Json<SuccessBody<MetricsBody>> {
    let cache: CacheStats = state.cache.stats();
    let body = MetricsBody {
        report: state.monitor.report(Some(cache)),
        realtime: state.realtime.registry.stats(),
        subscriptions: state
            .feed
            .as_ref()
            .map(|feed| feed.subscriptions())
            .unwrap_or_default(),
    };
    Json(SuccessBody::new(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_parses_directions() {
        let order = parse_order("created_at.desc, title").unwrap();
        assert_eq!(order, vec![Order::desc("created_at"), Order::asc("title")]);
        assert!(parse_order("title.sideways").is_err());
    }

    #[test]
    fn defaults_and_filters_decode() {
        let query = TableListQuery {
            filters: Some(r#"{"user_id":"u1","status":["a","b"]}"#.to_string()),
            select: Some("id, title".to_string()),
            ..Default::default()
        };
        let page = query.into_page().unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 20);
        assert_eq!(page.filters.len(), 2);
        assert_eq!(page.columns, Some(vec!["id".to_string(), "title".to_string()]));
    }

    #[test]
    fn malformed_filters_are_validation_errors() {
        let query = TableListQuery {
            filters: Some("{nope".to_string()),
            ..Default::default()
        };
        assert!(matches!(query.into_page(), Err(AppError::Validation(_))));
    }
}
