use statistics_client::domain::{SeriesId, StoredRow};
use time::{Duration, OffsetDateTime};

use crate::{
    store::{StatisticsStore, StoreError},
    transform::Baseline,
};

/// Delta base for an import that lands at or before the store tip.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImportBase {
    pub state: Option<f64>,
    pub sum: Option<f64>,
}

impl From<ImportBase> for Baseline {
    fn from(base: ImportBase) -> Self {
        Baseline {
            effective_last_time: None,
            last_reading: base.state,
            last_sum: base.sum,
        }
    }
}

/// An import starting at `first_import_time` overlaps already stored history.
pub fn is_backfill(first_import_time: OffsetDateTime, store_tip: Option<&StoredRow>) -> bool {
    matches!(store_tip, Some(tip) if first_import_time <= tip.start)
}

/// Base from the last row strictly before the import window, looking back at
/// most `lookback`. Without one the first imported row gets delta 0.
pub async fn resolve_import_base(
    store: &dyn StatisticsStore,
    series: &SeriesId,
    first_import_time: OffsetDateTime,
    lookback: Duration,
) -> Result<ImportBase, StoreError> {
    let not_before = first_import_time
        .checked_sub(lookback)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);

    let base = store
        .last_row_before(series, first_import_time, not_before)
        .await?
        .map(|row| ImportBase {
            state: Some(row.state),
            sum: Some(row.sum),
        })
        .unwrap_or_default();

    tracing::debug!(
        series = %series,
        first_import = %first_import_time,
        base_state = ?base.state,
        base_sum = ?base.sum,
        "resolved backfill import base"
    );
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transform::to_delta_rows;
    use statistics_client::domain::{Reading, Unit};
    use time::macros::datetime;

    fn hour(h: i64) -> OffsetDateTime {
        datetime!(2026-03-01 00:00 UTC) + Duration::hours(h)
    }

    #[tokio::test]
    async fn backfill_continues_from_row_before_window() {
        let store = MemoryStore::new();
        let series = SeriesId::consumption("m-1");
        let rows: Vec<StoredRow> = [(1, 50.0, 40.0), (2, 52.0, 42.0), (5, 60.0, 50.0)]
            .iter()
            .map(|(h, state, sum)| StoredRow::new(hour(*h), *state, *sum))
            .collect();
        store.upsert(&series, &rows).await.unwrap();

        assert!(is_backfill(hour(3), store.last_row(&series).await.unwrap().as_ref()));

        let base = resolve_import_base(&store, &series, hour(3), Duration::days(365))
            .await
            .unwrap();
        assert_eq!(base, ImportBase { state: Some(52.0), sum: Some(42.0) });

        let imported = to_delta_rows(&[Reading::new(hour(3), 53.0, Unit::Gallons)], &base.into());
        assert_eq!(imported[0].sum, 43.0);
    }

    #[tokio::test]
    async fn no_row_in_lookback_gives_empty_base() {
        let store = MemoryStore::new();
        let series = SeriesId::consumption("m-1");
        store
            .upsert(&series, &[StoredRow::new(hour(0) - Duration::days(400), 1.0, 1.0)])
            .await
            .unwrap();

        let base = resolve_import_base(&store, &series, hour(0), Duration::days(365))
            .await
            .unwrap();
        assert_eq!(base, ImportBase::default());
    }

    #[test]
    fn imports_after_the_tip_are_not_backfills() {
        let tip = StoredRow::new(hour(5), 1.0, 1.0);
        assert!(!is_backfill(hour(6), Some(&tip)));
        assert!(is_backfill(hour(5), Some(&tip)));
        assert!(!is_backfill(hour(0), None));
    }
}
