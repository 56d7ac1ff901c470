use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Jitter, Quota, RateLimiter};
use moka::future::Cache;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{ColumnMap, Row, RowStore, Sheet, StoreError, WriteBatch};

/// Wraps a store with a request quota and a short-lived header cache.
///
/// Hosted spreadsheet backends throttle aggressively, so every call waits on
/// the limiter first. Column maps are cached for `column_cache_ttl` and
/// dropped as soon as a write reports an unknown column.
pub struct RateLimitedStore<S> {
    inner: S,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    columns: Cache<Sheet, ColumnMap>,
}

impl<S: RowStore> RateLimitedStore<S> {
    pub fn new(inner: S, requests_per_second: u32, burst: u32, column_cache_ttl: Duration) -> Self {
        let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);

        let columns = Cache::builder()
            .max_capacity(16)
            .time_to_live(column_cache_ttl)
            .build();

        Self {
            inner,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            columns,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn throttle(&self) {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(20)))
            .await;
    }

    /// Forget cached headers, e.g. after the sheet layout changed.
    pub fn invalidate_columns(&self) {
        self.columns.invalidate_all();
        info!("Column map cache cleared");
    }

    async fn on_write_error(&self, err: &StoreError) {
        if let StoreError::UnknownColumn { sheet, .. } = err {
            self.columns.invalidate(sheet).await;
            debug!(sheet = %sheet, "Dropped cached column map after unknown column");
        }
    }
}

#[async_trait]
impl<S: RowStore> RowStore for RateLimitedStore<S> {
    async fn read_row(&self, sheet: Sheet, key: &str) -> Result<Option<Row>, StoreError> {
        self.throttle().await;
        self.inner.read_row(sheet, key).await
    }

    async fn read_children(
        &self,
        sheet: Sheet,
        parent_column: &str,
        parent_key: &str,
    ) -> Result<Vec<Row>, StoreError> {
        self.throttle().await;
        self.inner.read_children(sheet, parent_column, parent_key).await
    }

    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Row>, StoreError> {
        self.throttle().await;
        self.inner.read_all(sheet).await
    }

    async fn column_map(&self, sheet: Sheet) -> Result<ColumnMap, StoreError> {
        if let Some(cached) = self.columns.get(&sheet).await {
            debug!(sheet = %sheet, "Column map cache hit");
            return Ok(cached);
        }
        self.throttle().await;
        let map = self.inner.column_map(sheet).await?;
        self.columns.insert(sheet, map.clone()).await;
        Ok(map)
    }

    async fn batch_write(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.throttle().await;
        let result = self.inner.batch_write(batch).await;
        if let Err(err) = &result {
            self.on_write_error(err).await;
        }
        result
    }

    async fn append_rows(&self, sheet: Sheet, rows: &[Row]) -> Result<(), StoreError> {
        self.throttle().await;
        let result = self.inner.append_rows(sheet, rows).await;
        if let Err(err) = &result {
            self.on_write_error(err).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryRowStore, MockRowStore};

    #[tokio::test]
    async fn column_maps_are_cached() {
        let mut mock = MockRowStore::new();
        mock.expect_column_map()
            .times(1)
            .returning(|sheet| Ok(ColumnMap::from_headers(sheet.default_headers().iter().copied())));

        let store = RateLimitedStore::new(mock, 100, 100, Duration::from_secs(60));
        let first = store.column_map(Sheet::Units).await.unwrap();
        let second = store.column_map(Sheet::Units).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_column_invalidates_cache() {
        let inner = InMemoryRowStore::default();
        let store = RateLimitedStore::new(inner, 100, 100, Duration::from_secs(60));
        assert!(store.column_map(Sheet::Units).await.unwrap().contains("VERSION"));

        store
            .inner()
            .set_headers(Sheet::Units, vec!["TAG_SPOOL".to_string()])
            .await;
        let mut batch = WriteBatch::new();
        batch.push(Sheet::Units, "SP-01", Row::new().with("VERSION", "v1"));
        let err = store.batch_write(&batch).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownColumn { .. }));

        assert!(!store.column_map(Sheet::Units).await.unwrap().contains("VERSION"));
    }

    #[test]
    fn zero_quota_falls_back_to_minimum() {
        let store = RateLimitedStore::new(InMemoryRowStore::default(), 0, 0, Duration::from_secs(1));
        assert!(store.rate_limiter.check().is_ok());
    }
}
