use statistics_client::domain::{SeriesId, SERIES_ID_PREFIX};
use time::{Duration, OffsetDateTime};

use super::ReconcileError;
use crate::store::{StatisticsStore, StoreError};

pub const VALIDATION_BATCH_HOURS: i64 = 1000;
pub const MAX_VIOLATION_LOG_DISPLAY: usize = 10;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MonotonicViolation {
    /// Position of the offending row in the scanned sequence.
    pub index: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub previous_sum: f64,
    pub current_sum: f64,
}

impl MonotonicViolation {
    pub fn drop_amount(&self) -> f64 {
        self.previous_sum - self.current_sum
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MonotonicReport {
    pub series: SeriesId,
    pub checked: usize,
    pub violations: Vec<MonotonicViolation>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
}

impl MonotonicReport {
    pub fn is_monotonic(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Scan a series for rows whose `sum` drops below the previous row's.
///
/// `window` limits the scan to the trailing period ending at `now`; `None`
/// scans the whole history. Read-only.
pub async fn validate_monotonic(
    store: &dyn StatisticsStore,
    series: &SeriesId,
    window: Option<Duration>,
    now: OffsetDateTime,
) -> Result<MonotonicReport, StoreError> {
    let start_time = window.map(|w| now - w);
    let mut report = MonotonicReport {
        series: series.clone(),
        checked: 0,
        violations: Vec::new(),
        start_time,
    };

    let first = store.first_row(series).await?;
    let last = store.last_row(series).await?;
    let (Some(first), Some(last)) = (first, last) else {
        tracing::info!(series = %series, "no statistics stored, nothing to validate");
        return Ok(report);
    };

    let end = last.start + Duration::nanoseconds(1);
    let mut cursor = start_time.map_or(first.start, |t| t.max(first.start));
    let mut previous_sum: Option<f64> = None;

    while cursor < end {
        let next = (cursor + Duration::hours(VALIDATION_BATCH_HOURS)).min(end);
        for row in store.rows_in_range(series, cursor, next).await? {
            if let Some(previous) = previous_sum {
                if row.sum < previous {
                    report.violations.push(MonotonicViolation {
                        index: report.checked,
                        at: row.start,
                        previous_sum: previous,
                        current_sum: row.sum,
                    });
                }
            }
            previous_sum = Some(row.sum);
            report.checked += 1;
        }
        cursor = next;
    }

    if report.is_monotonic() {
        tracing::info!(series = %series, checked = report.checked, "statistics sums are monotonic");
    } else {
        tracing::warn!(
            series = %series,
            checked = report.checked,
            violations = report.violations.len(),
            "statistics sums decrease"
        );
        for v in report.violations.iter().take(MAX_VIOLATION_LOG_DISPLAY) {
            tracing::warn!(
                series = %series,
                at = %v.at,
                previous_sum = v.previous_sum,
                current_sum = v.current_sum,
                drop = v.drop_amount(),
                "sum decreased"
            );
        }
        if report.violations.len() > MAX_VIOLATION_LOG_DISPLAY {
            tracing::warn!(
                series = %series,
                omitted = report.violations.len() - MAX_VIOLATION_LOG_DISPLAY,
                "further violations not logged"
            );
        }
    }

    Ok(report)
}

/// Delete every row of `series`. `confirmation` must repeat the series id.
pub async fn reset_series(
    store: &dyn StatisticsStore,
    series: &SeriesId,
    confirmation: &str,
) -> Result<u64, ReconcileError> {
    if confirmation != series.as_str() {
        return Err(ReconcileError::ConfirmationRequired(series.clone()));
    }

    let deleted = store.delete_series(series).await?;
    tracing::warn!(series = %series, deleted, "deleted all statistics for series");
    Ok(deleted)
}

/// Pick the series an operator means: an explicit series id, then an entity
/// id already carrying the series prefix, then a meter id.
pub fn resolve_series_id(
    series_id: Option<&str>,
    entity_id: Option<&str>,
    meter_id: Option<&str>,
) -> Option<SeriesId> {
    fn non_empty(s: Option<&str>) -> Option<&str> {
        s.map(str::trim).filter(|s| !s.is_empty())
    }

    if let Some(series_id) = non_empty(series_id) {
        return Some(SeriesId::new(series_id));
    }
    if let Some(entity_id) = non_empty(entity_id).filter(|e| e.starts_with(SERIES_ID_PREFIX)) {
        return Some(SeriesId::new(entity_id));
    }
    non_empty(meter_id).map(SeriesId::consumption)
}
