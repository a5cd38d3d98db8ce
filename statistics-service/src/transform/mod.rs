use statistics_client::domain::{Reading, StoredRow};
use time::{macros::datetime, OffsetDateTime};

pub mod cost;

pub use cost::{resolve_price, to_cost_rows, PriceSkip};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReadingRejected {
    #[error("reading value {0} is not a finite number")]
    NotFinite(f64),
    #[error("reading value {0} must be non-negative")]
    Negative(f64),
    #[error("timestamp {0} out of allowed range")]
    OutOfRange(OffsetDateTime),
}

/// Where a conversion continues from: the last imported instant, the
/// absolute reading at that instant and the cumulative sum reached there.
///
/// An empty baseline means "fresh series": deltas start at 0 and sums at 0.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Baseline {
    pub effective_last_time: Option<OffsetDateTime>,
    pub last_reading: Option<f64>,
    pub last_sum: Option<f64>,
}

impl Baseline {
    pub fn from_row(row: &StoredRow) -> Self {
        Self {
            effective_last_time: Some(row.start),
            last_reading: Some(row.state),
            last_sum: Some(row.sum),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.effective_last_time.is_none() && self.last_reading.is_none() && self.last_sum.is_none()
    }
}

/// Pure validation of a single reading.
///
/// Rules:
/// - value must be finite and non-negative.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_reading(reading: &Reading) -> Result<(), ReadingRejected> {
    if !reading.value.is_finite() {
        return Err(ReadingRejected::NotFinite(reading.value));
    }
    if reading.value < 0.0 {
        return Err(ReadingRejected::Negative(reading.value));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if reading.ts < min_ts || reading.ts > max_ts {
        return Err(ReadingRejected::OutOfRange(reading.ts));
    }

    Ok(())
}

/// Drop readings that fail [`validate_reading`], counting each rejection.
pub fn accept_valid(meter_id: &str, readings: Vec<Reading>) -> Vec<Reading> {
    readings
        .into_iter()
        .filter(|r| match validate_reading(r) {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("statistics_readings_rejected_total").increment(1);
                tracing::debug!(meter_id, error = %e, "dropping invalid reading");
                false
            }
        })
        .collect()
}

/// Clamp backward jumps so the sequence never decreases.
///
/// A reading below the running maximum is replaced by that maximum. Length
/// and order are preserved.
pub fn normalize(readings: &[Reading]) -> Vec<Reading> {
    let mut running_max: Option<f64> = None;
    readings
        .iter()
        .map(|r| {
            let value = match running_max {
                Some(max) if r.value < max => max,
                _ => r.value,
            };
            running_max = Some(value);
            Reading::new(r.ts, value, r.unit)
        })
        .collect()
}

/// Readings strictly newer than `after`; `None` keeps everything.
pub fn filter_newer(readings: &[Reading], after: Option<OffsetDateTime>) -> Vec<Reading> {
    match after {
        Some(after) => readings.iter().filter(|r| r.ts > after).cloned().collect(),
        None => readings.to_vec(),
    }
}

/// Pair every reading with its clamped value and its volume delta from the
/// previous one.
///
/// The running maximum is seeded with `last_reading`, so a reading below the
/// baseline is held at the baseline and contributes 0. The first delta is 0
/// when there is no baseline reading.
pub(crate) fn volume_deltas(
    readings: &[Reading],
    last_reading: Option<f64>,
) -> impl Iterator<Item = (OffsetDateTime, f64, f64)> + '_ {
    let mut previous = last_reading.or_else(|| readings.first().map(|r| r.value));
    readings.iter().map(move |r| {
        let value = previous.map_or(r.value, |p| r.value.max(p));
        let delta = previous.map_or(0.0, |p| value - p);
        previous = Some(value);
        (r.ts, value, delta)
    })
}

/// Convert absolute readings into cumulative rows continuing from `baseline`.
pub fn to_delta_rows(readings: &[Reading], baseline: &Baseline) -> Vec<StoredRow> {
    let mut cumulative = baseline.last_sum.unwrap_or(0.0);
    volume_deltas(readings, baseline.last_reading)
        .map(|(ts, value, delta)| {
            cumulative += delta;
            StoredRow::new(ts, value, cumulative)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use statistics_client::domain::Unit;
    use time::Duration;

    fn readings(values: &[f64]) -> Vec<Reading> {
        let t0 = datetime!(2026-01-01 00:00 UTC);
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Reading::new(t0 + Duration::hours(i as i64), *v, Unit::Gallons))
            .collect()
    }

    fn values(readings: &[Reading]) -> Vec<f64> {
        readings.iter().map(|r| r.value).collect()
    }

    #[test]
    fn validation_rejects_negative_nan_and_out_of_range() {
        let ok = Reading::new(datetime!(2024-01-01 00:00:00 UTC), 1.0, Unit::Gallons);
        assert!(validate_reading(&ok).is_ok());

        let negative = Reading::new(ok.ts, -0.1, Unit::Gallons);
        assert_eq!(validate_reading(&negative), Err(ReadingRejected::Negative(-0.1)));

        let nan = Reading::new(ok.ts, f64::NAN, Unit::Gallons);
        assert!(matches!(validate_reading(&nan), Err(ReadingRejected::NotFinite(_))));

        let ancient = Reading::new(datetime!(1800-01-01 00:00:00 UTC), 1.0, Unit::Gallons);
        assert!(matches!(validate_reading(&ancient), Err(ReadingRejected::OutOfRange(_))));
    }

    #[test]
    fn accept_valid_drops_only_rejected_readings() {
        let mut input = readings(&[1.0, 2.0, 3.0]);
        input[1].value = f64::INFINITY;

        assert_eq!(values(&accept_valid("m-1", input)), vec![1.0, 3.0]);
    }

    #[test]
    fn normalize_clamps_backward_jumps() {
        let out = normalize(&readings(&[100.0, 105.0, 0.0, 107.0]));
        assert_eq!(values(&out), vec![100.0, 105.0, 105.0, 107.0]);
    }

    #[test]
    fn normalize_is_idempotent_and_keeps_length() {
        let input = readings(&[5.0, 3.0, 3.0, 9.0, 1.0]);
        let once = normalize(&input);
        let twice = normalize(&once);

        assert_eq!(once.len(), input.len());
        assert_eq!(once, twice);
        assert!(once.windows(2).all(|w| w[1].value >= w[0].value));
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn filter_newer_is_strict() {
        let input = readings(&[1.0, 2.0, 3.0]);
        let after = input[1].ts;

        assert_eq!(values(&filter_newer(&input, Some(after))), vec![3.0]);
        assert_eq!(filter_newer(&input, None).len(), 3);
    }

    #[test]
    fn fresh_series_starts_at_zero() {
        let rows = to_delta_rows(&readings(&[1000.0, 1005.0, 1012.0]), &Baseline::default());

        let sums: Vec<f64> = rows.iter().map(|r| r.sum).collect();
        let states: Vec<f64> = rows.iter().map(|r| r.state).collect();
        assert_eq!(sums, vec![0.0, 5.0, 12.0]);
        assert_eq!(states, vec![1000.0, 1005.0, 1012.0]);
    }

    #[test]
    fn continuation_adds_deltas_to_the_baseline_sum() {
        let baseline = Baseline {
            effective_last_time: Some(datetime!(2025-12-31 23:00 UTC)),
            last_reading: Some(204_211.8),
            last_sum: Some(11_460.0),
        };

        let rows = to_delta_rows(&readings(&[204_215.0, 204_220.0]), &baseline);
        assert!((rows[0].sum - 11_463.2).abs() < 1e-6);
        assert!((rows[1].sum - 11_468.2).abs() < 1e-6);
    }

    #[test]
    fn delta_conversion_is_deterministic() {
        let input = readings(&[3.0, 4.5, 10.0]);
        let baseline = Baseline {
            effective_last_time: None,
            last_reading: Some(2.0),
            last_sum: Some(40.0),
        };

        assert_eq!(to_delta_rows(&input, &baseline), to_delta_rows(&input, &baseline));
        assert!(to_delta_rows(&[], &baseline).is_empty());
    }

    #[test]
    fn reading_below_the_baseline_never_lowers_the_sum() {
        let baseline = Baseline {
            effective_last_time: Some(datetime!(2025-12-31 23:00 UTC)),
            last_reading: Some(105.0),
            last_sum: Some(5.0),
        };

        let rows = to_delta_rows(&readings(&[103.0, 107.0]), &baseline);
        let sums: Vec<f64> = rows.iter().map(|r| r.sum).collect();
        let states: Vec<f64> = rows.iter().map(|r| r.state).collect();
        assert_eq!(sums, vec![5.0, 7.0]);
        assert_eq!(states, vec![105.0, 107.0]);
    }
}
