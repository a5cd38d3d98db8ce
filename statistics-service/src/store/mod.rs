use std::collections::BTreeMap;

use statistics_client::domain::{SeriesId, StoredRow};
use time::OffsetDateTime;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStatisticsStore;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("statistics store unavailable: {0}")]
    Unavailable(String),
}

/// Durable ordered store of cumulative rows keyed by `(series_id, start)`.
///
/// Upserts are idempotent and last-writer-wins per key. The store does not
/// check that `sum` is non-decreasing, and other processes may write to it
/// at any time.
#[async_trait::async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn upsert(&self, series: &SeriesId, rows: &[StoredRow]) -> Result<(), StoreError>;

    async fn first_row(&self, series: &SeriesId) -> Result<Option<StoredRow>, StoreError>;

    async fn last_row(&self, series: &SeriesId) -> Result<Option<StoredRow>, StoreError>;

    /// Latest row with `not_before <= start < before`.
    async fn last_row_before(
        &self,
        series: &SeriesId,
        before: OffsetDateTime,
        not_before: OffsetDateTime,
    ) -> Result<Option<StoredRow>, StoreError>;

    /// Rows with `from <= start < to`, ascending by `start`.
    async fn rows_in_range(
        &self,
        series: &SeriesId,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<StoredRow>, StoreError>;

    /// Row with the largest `sum`; the latest such row on a tie.
    async fn row_with_max_sum(&self, series: &SeriesId) -> Result<Option<StoredRow>, StoreError>;

    async fn delete_rows_after(
        &self,
        series: &SeriesId,
        after: OffsetDateTime,
    ) -> Result<u64, StoreError>;

    async fn delete_series(&self, series: &SeriesId) -> Result<u64, StoreError>;
}

/// Collapse rows sharing a `start`, keeping the last one, in `start` order.
pub(crate) fn dedupe_by_start(rows: &[StoredRow]) -> Vec<StoredRow> {
    let mut by_start: BTreeMap<OffsetDateTime, StoredRow> = BTreeMap::new();
    for row in rows {
        by_start.insert(row.start, *row);
    }
    by_start.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn dedupe_keeps_last_write_per_start() {
        let t0 = datetime!(2026-02-01 00:00 UTC);
        let t1 = datetime!(2026-02-01 01:00 UTC);
        let rows = vec![
            StoredRow::new(t1, 10.0, 1.0),
            StoredRow::new(t0, 5.0, 0.0),
            StoredRow::new(t1, 11.0, 2.0),
        ];

        let deduped = dedupe_by_start(&rows);
        assert_eq!(deduped, vec![StoredRow::new(t0, 5.0, 0.0), StoredRow::new(t1, 11.0, 2.0)]);
    }
}
