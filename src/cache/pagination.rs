//! Page-shaped results on top of [`QueryCache`].
//!
//! The whole [`PageResult`] (rows and metadata) is cached as one entry, so a
//! hit never recomputes counts or links.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use datagate_api_types::PageMeta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::keys::pagination_key;
use super::query::QueryCache;
use crate::domain::Filters;

/// Normalised page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub page: u64,
    pub page_size: u64,
}

impl PageRequest {
    /// Clamp raw inputs: `page >= 1`, `1 <= page_size <= max_page_size`.
    /// Non-positive values are clamped, never rejected.
    pub fn normalize(page: i64, page_size: i64, max_page_size: u64) -> Self {
        let max_page_size = max_page_size.max(1);
        let page = u64::try_from(page).unwrap_or(0).max(1);
        let page_size = u64::try_from(page_size)
            .unwrap_or(0)
            .clamp(1, max_page_size);
        Self { page, page_size }
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        self.page_size
    }
}

/// Rows of one page plus the total row count across all pages.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSlice<T> {
    pub items: Vec<T>,
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub pagination: PageMeta,
    pub filters: Filters,
    /// Whether this result was served from the cache. Stored entries always
    /// carry `false`; the flag is set on the way out.
    pub cached: bool,
}

pub struct PaginationEngine {
    queries: Arc<QueryCache>,
    max_page_size: u64,
}

impl PaginationEngine {
    pub fn new(queries: Arc<QueryCache>, max_page_size: u64) -> Self {
        Self {
            queries,
            max_page_size: max_page_size.max(1),
        }
    }

    pub fn max_page_size(&self) -> u64 {
        self.max_page_size
    }

    pub fn request(&self, page: i64, page_size: i64) -> PageRequest {
        PageRequest::normalize(page, page_size, self.max_page_size)
    }

    /// Serve one page of `base_key`.
    ///
    /// `loader(offset, limit, filters)` runs only on a miss. Its error is
    /// returned unchanged and nothing is cached.
    pub async fn paginate<T, E, F, Fut>(
        &self,
        base_key: &str,
        page: i64,
        page_size: i64,
        filters: &Filters,
        ttl: Duration,
        loader: F,
    ) -> Result<PageResult<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(u64, u64, Filters) -> Fut,
        Fut: Future<Output = Result<PageSlice<T>, E>>,
    {
        let request = self.request(page, page_size);
        let key = pagination_key(
            base_key,
            &json!({
                "page": request.page,
                "pageSize": request.page_size,
                "filters": filters,
            }),
        );

        let cached = self
            .queries
            .cached(&key, ttl, || async {
                let slice = loader(request.offset(), request.limit(), filters.clone()).await?;
                Ok::<_, E>(PageResult {
                    items: slice.items,
                    pagination: PageMeta::new(request.page, request.page_size, slice.total_count),
                    filters: filters.clone(),
                    cached: false,
                })
            })
            .await?;

        let mut result = cached.value;
        result.cached = cached.from_cache;
        Ok(result)
    }
}
