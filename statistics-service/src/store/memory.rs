use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use statistics_client::domain::{SeriesId, StoredRow};
use time::OffsetDateTime;

use super::{StatisticsStore, StoreError};

type SeriesRows = BTreeMap<OffsetDateTime, StoredRow>;

/// In-process ordered store with the same upsert semantics as the SQL table.
///
/// Used for dry runs and by the engine tests. [`MemoryStore::set_unavailable`]
/// makes every call fail, which is how store outages are simulated.
#[derive(Default)]
pub struct MemoryStore {
    series: Mutex<HashMap<SeriesId, SeriesRows>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every stored row of a series, ascending by `start`.
    pub fn rows(&self, series: &SeriesId) -> Vec<StoredRow> {
        self.lock()
            .get(series)
            .map(|rows| rows.values().copied().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SeriesId, SeriesRows>> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn read<R>(
        &self,
        series: &SeriesId,
        f: impl FnOnce(&SeriesRows) -> R,
    ) -> Result<R, StoreError> {
        self.check_available()?;
        let guard = self.lock();
        let empty = SeriesRows::new();
        Ok(f(guard.get(series).unwrap_or(&empty)))
    }
}

#[async_trait::async_trait]
impl StatisticsStore for MemoryStore {
    async fn upsert(&self, series: &SeriesId, rows: &[StoredRow]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut guard = self.lock();
        let stored = guard.entry(series.clone()).or_default();
        for row in rows {
            stored.insert(row.start, *row);
        }
        Ok(())
    }

    async fn first_row(&self, series: &SeriesId) -> Result<Option<StoredRow>, StoreError> {
        self.read(series, |rows| rows.values().next().copied())
    }

    async fn last_row(&self, series: &SeriesId) -> Result<Option<StoredRow>, StoreError> {
        self.read(series, |rows| rows.values().next_back().copied())
    }

    async fn last_row_before(
        &self,
        series: &SeriesId,
        before: OffsetDateTime,
        not_before: OffsetDateTime,
    ) -> Result<Option<StoredRow>, StoreError> {
        if not_before >= before {
            return Ok(None);
        }
        self.read(series, |rows| rows.range(not_before..before).next_back().map(|(_, row)| *row))
    }

    async fn rows_in_range(
        &self,
        series: &SeriesId,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<StoredRow>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        self.read(series, |rows| rows.range(from..to).map(|(_, row)| *row).collect())
    }

    async fn row_with_max_sum(&self, series: &SeriesId) -> Result<Option<StoredRow>, StoreError> {
        self.read(series, |rows| {
            rows.values().fold(None, |best: Option<StoredRow>, row| match best {
                Some(b) if b.sum > row.sum => Some(b),
                _ => Some(*row),
            })
        })
    }

    async fn delete_rows_after(
        &self,
        series: &SeriesId,
        after: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut guard = self.lock();
        let Some(rows) = guard.get_mut(series) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|start, _| *start <= after);
        Ok((before - rows.len()) as u64)
    }

    async fn delete_series(&self, series: &SeriesId) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.lock().remove(series).map(|rows| rows.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn series() -> SeriesId {
        SeriesId::consumption("m-1")
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_keys() {
        let store = MemoryStore::new();
        let t0 = datetime!(2026-02-01 00:00 UTC);

        store.upsert(&series(), &[StoredRow::new(t0, 1.0, 1.0)]).await.unwrap();
        store.upsert(&series(), &[StoredRow::new(t0, 2.0, 5.0)]).await.unwrap();

        assert_eq!(store.rows(&series()), vec![StoredRow::new(t0, 2.0, 5.0)]);
    }

    #[tokio::test]
    async fn range_queries_are_half_open() {
        let store = MemoryStore::new();
        let t0 = datetime!(2026-02-01 00:00 UTC);
        let t1 = datetime!(2026-02-01 01:00 UTC);
        let t2 = datetime!(2026-02-01 02:00 UTC);
        store
            .upsert(
                &series(),
                &[
                    StoredRow::new(t0, 1.0, 0.0),
                    StoredRow::new(t1, 2.0, 1.0),
                    StoredRow::new(t2, 3.0, 2.0),
                ],
            )
            .await
            .unwrap();

        let rows = store.rows_in_range(&series(), t0, t2).await.unwrap();
        assert_eq!(rows.len(), 2);

        let before = store.last_row_before(&series(), t2, t0).await.unwrap();
        assert_eq!(before.map(|r| r.start), Some(t1));

        let none = store.last_row_before(&series(), t0, t0).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn max_sum_prefers_latest_on_tie() {
        let store = MemoryStore::new();
        let t0 = datetime!(2026-02-01 00:00 UTC);
        let t1 = datetime!(2026-02-01 01:00 UTC);
        let t2 = datetime!(2026-02-01 02:00 UTC);
        store
            .upsert(
                &series(),
                &[
                    StoredRow::new(t0, 1.0, 30.0),
                    StoredRow::new(t1, 1.0, 30.0),
                    StoredRow::new(t2, 1.0, 5.0),
                ],
            )
            .await
            .unwrap();

        let max = store.row_with_max_sum(&series()).await.unwrap().unwrap();
        assert_eq!(max.start, t1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = store.last_row(&series()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.upsert(&series(), &[]).await.is_err());
    }

    #[tokio::test]
    async fn delete_rows_after_keeps_the_boundary_row() {
        let store = MemoryStore::new();
        let t0 = datetime!(2026-02-01 00:00 UTC);
        let t1 = datetime!(2026-02-01 01:00 UTC);
        store
            .upsert(&series(), &[StoredRow::new(t0, 1.0, 0.0), StoredRow::new(t1, 2.0, 1.0)])
            .await
            .unwrap();

        assert_eq!(store.delete_rows_after(&series(), t0).await.unwrap(), 1);
        assert_eq!(store.rows(&series()), vec![StoredRow::new(t0, 1.0, 0.0)]);
        assert_eq!(store.delete_series(&series()).await.unwrap(), 1);
        assert!(store.rows(&series()).is_empty());
    }
}
