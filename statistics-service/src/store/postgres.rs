use std::time::Duration;

use sqlx::postgres::PgPool;
use statistics_client::{
    db::statistics_queries,
    domain::{SeriesId, StoredRow},
};
use time::OffsetDateTime;

use super::{dedupe_by_start, StatisticsStore, StoreError};
use crate::config::StoreConfig;

pub struct PgStatisticsStore {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl PgStatisticsStore {
    pub fn new(pool: PgPool, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    pub fn from_config(pool: PgPool, cfg: &StoreConfig) -> Self {
        Self::new(
            pool,
            cfg.batch_size,
            cfg.max_retries,
            Duration::from_millis(cfg.retry_backoff_ms),
        )
    }

    async fn flush_batch(&self, series: &SeriesId, batch: &[StoredRow]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            match statistics_queries::upsert_rows(&self.pool, series, batch).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    metrics::counter!("statistics_store_retry_total").increment(1);
                    tracing::warn!(
                        error = %e,
                        series = %series,
                        attempt,
                        "statistics upsert failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        series = %series,
                        "statistics upsert failed, giving up"
                    );
                    return Err(unavailable(e));
                }
            }
        }
    }
}

fn unavailable(e: anyhow::Error) -> StoreError {
    metrics::counter!("statistics_store_errors_total").increment(1);
    StoreError::Unavailable(e.to_string())
}

#[async_trait::async_trait]
impl StatisticsStore for PgStatisticsStore {
    async fn upsert(&self, series: &SeriesId, rows: &[StoredRow]) -> Result<(), StoreError> {
        let rows = dedupe_by_start(rows);
        for chunk in rows.chunks(self.batch_size) {
            self.flush_batch(series, chunk).await?;
        }
        Ok(())
    }

    async fn first_row(&self, series: &SeriesId) -> Result<Option<StoredRow>, StoreError> {
        statistics_queries::first_row(&self.pool, series).await.map_err(unavailable)
    }

    async fn last_row(&self, series: &SeriesId) -> Result<Option<StoredRow>, StoreError> {
        statistics_queries::last_row(&self.pool, series).await.map_err(unavailable)
    }

    async fn last_row_before(
        &self,
        series: &SeriesId,
        before: OffsetDateTime,
        not_before: OffsetDateTime,
    ) -> Result<Option<StoredRow>, StoreError> {
        statistics_queries::last_row_before(&self.pool, series, before, not_before)
            .await
            .map_err(unavailable)
    }

    async fn rows_in_range(
        &self,
        series: &SeriesId,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<StoredRow>, StoreError> {
        statistics_queries::rows_in_range(&self.pool, series, from, to)
            .await
            .map_err(unavailable)
    }

    async fn row_with_max_sum(&self, series: &SeriesId) -> Result<Option<StoredRow>, StoreError> {
        statistics_queries::row_with_max_sum(&self.pool, series)
            .await
            .map_err(unavailable)
    }

    async fn delete_rows_after(
        &self,
        series: &SeriesId,
        after: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        statistics_queries::delete_rows_after(&self.pool, series, after)
            .await
            .map_err(unavailable)
    }

    async fn delete_series(&self, series: &SeriesId) -> Result<u64, StoreError> {
        statistics_queries::delete_series(&self.pool, series)
            .await
            .map_err(unavailable)
    }
}
