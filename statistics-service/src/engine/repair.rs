use statistics_client::domain::{SeriesId, StoredRow};
use time::{Duration, OffsetDateTime};

use crate::store::{StatisticsStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairKind {
    /// Rows after the last import carry a sum that disagrees with it.
    StoreAhead,
    /// The latest sum dropped below an earlier maximum.
    TailReset,
    /// Cost series flattened alongside a consumption repair.
    CostMirror,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairReport {
    pub kind: RepairKind,
    pub series: SeriesId,
    pub from: OffsetDateTime,
    pub through: OffsetDateTime,
    pub state: f64,
    pub sum: f64,
    pub rows_written: usize,
}

const NANOS_PER_HOUR: i128 = 3_600_000_000_000;

/// Start of the UTC hour containing `ts`.
pub fn floor_to_hour(ts: OffsetDateTime) -> OffsetDateTime {
    let nanos = ts.unix_timestamp_nanos();
    OffsetDateTime::from_unix_timestamp_nanos(nanos - nanos.rem_euclid(NANOS_PER_HOUR))
        .unwrap_or(ts)
}

/// Rows at every hour boundary strictly after `from` up to and including
/// `through`, all holding the same `state` and `sum`.
pub fn carry_forward_rows(
    from: OffsetDateTime,
    through: OffsetDateTime,
    state: f64,
    sum: f64,
) -> Vec<StoredRow> {
    let mut rows = Vec::new();
    if through <= from {
        return rows;
    }
    let mut start = floor_to_hour(from) + Duration::HOUR;
    while start <= through {
        rows.push(StoredRow::new(start, state, sum));
        start += Duration::HOUR;
    }
    rows
}

/// Overwrite `(from, through]` with flat rows so the series stops dropping.
pub async fn write_carry_forward(
    store: &dyn StatisticsStore,
    series: &SeriesId,
    from: OffsetDateTime,
    through: OffsetDateTime,
    state: f64,
    sum: f64,
) -> Result<usize, StoreError> {
    let rows = carry_forward_rows(from, through, state, sum);
    if rows.is_empty() {
        return Ok(0);
    }

    tracing::warn!(
        series = %series,
        from = %from,
        through = %through,
        rows = rows.len(),
        state,
        sum,
        "writing carry-forward rows over inconsistent statistics"
    );
    store.upsert(series, &rows).await?;
    metrics::counter!("statistics_repair_rows_total", "series" => series.to_string())
        .increment(rows.len() as u64);

    Ok(rows.len())
}

/// The trusted row and the store tip disagree on the accumulated sum.
pub fn sums_diverge(trusted: &StoredRow, tip: &StoredRow, tolerance: f64) -> bool {
    (trusted.sum - tip.sum).abs() > tolerance
}

/// An earlier row holds a larger sum than the tip.
pub fn exceeds_tip(max_row: &StoredRow, tip: &StoredRow, tolerance: f64) -> bool {
    max_row.start < tip.start && max_row.sum > tip.sum + tolerance
}

/// State and sum to carry forward from a max-sum anchor.
///
/// A live reading at or above the anchor's state extends the sum by the
/// volume used since; otherwise the anchor is held as is.
pub fn carried_values(anchor: &StoredRow, live_reading: Option<f64>) -> (f64, f64) {
    match live_reading {
        Some(live) if live.is_finite() && live >= anchor.state => {
            (live, anchor.sum + (live - anchor.state))
        }
        _ => (anchor.state, anchor.sum),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use time::macros::datetime;

    #[test]
    fn floor_to_hour_truncates_minutes() {
        assert_eq!(
            floor_to_hour(datetime!(2026-01-01 10:42:17.5 UTC)),
            datetime!(2026-01-01 10:00 UTC)
        );
        assert_eq!(floor_to_hour(datetime!(2026-01-01 10:00 UTC)), datetime!(2026-01-01 10:00 UTC));
        assert_eq!(
            floor_to_hour(datetime!(2026-01-01 10:42 +05:30)),
            datetime!(2026-01-01 05:00 UTC)
        );
    }

    #[test]
    fn carry_forward_covers_every_hour_after_from() {
        let from = datetime!(2026-01-01 10:00 UTC);
        let through = datetime!(2026-01-01 13:00 UTC);

        let rows = carry_forward_rows(from, through, 42.0, 7.0);
        let starts: Vec<_> = rows.iter().map(|r| r.start).collect();
        assert_eq!(
            starts,
            vec![
                datetime!(2026-01-01 11:00 UTC),
                datetime!(2026-01-01 12:00 UTC),
                datetime!(2026-01-01 13:00 UTC),
            ]
        );
        assert!(rows.iter().all(|r| r.state == 42.0 && r.sum == 7.0));
    }

    #[test]
    fn carry_forward_is_empty_when_through_is_not_after_from() {
        let t = datetime!(2026-01-01 10:00 UTC);
        assert!(carry_forward_rows(t, t, 1.0, 1.0).is_empty());
        assert!(carry_forward_rows(t, t - Duration::HOUR, 1.0, 1.0).is_empty());
    }

    #[test]
    fn carried_values_use_live_reading_only_when_not_behind() {
        let anchor = StoredRow::new(datetime!(2026-01-01 10:00 UTC), 130.0, 30.0);

        assert_eq!(carried_values(&anchor, Some(134.0)), (134.0, 34.0));
        assert_eq!(carried_values(&anchor, Some(120.0)), (130.0, 30.0));
        assert_eq!(carried_values(&anchor, None), (130.0, 30.0));
    }

    #[test]
    fn detection_respects_tolerance() {
        let t0 = datetime!(2026-01-01 10:00 UTC);
        let t1 = datetime!(2026-01-01 11:00 UTC);

        assert!(!sums_diverge(
            &StoredRow::new(t0, 1.0, 10.0),
            &StoredRow::new(t1, 1.0, 10.005),
            0.01
        ));
        assert!(sums_diverge(&StoredRow::new(t0, 1.0, 10.0), &StoredRow::new(t1, 1.0, 3.0), 0.01));
        assert!(exceeds_tip(&StoredRow::new(t0, 1.0, 30.0), &StoredRow::new(t1, 1.0, 8.0), 0.01));
        assert!(!exceeds_tip(&StoredRow::new(t1, 1.0, 30.0), &StoredRow::new(t1, 1.0, 30.0), 0.01));
    }

    #[tokio::test]
    async fn write_carry_forward_is_idempotent() {
        let store = MemoryStore::new();
        let series = SeriesId::consumption("m-1");
        let from = datetime!(2026-01-01 10:00 UTC);
        let through = datetime!(2026-01-01 12:00 UTC);

        let first = write_carry_forward(&store, &series, from, through, 5.0, 2.0).await.unwrap();
        let after_first = store.rows(&series);
        let second = write_carry_forward(&store, &series, from, through, 5.0, 2.0).await.unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 2);
        assert_eq!(store.rows(&series), after_first);
    }
}
