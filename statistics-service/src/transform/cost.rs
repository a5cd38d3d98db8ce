use statistics_client::domain::{Reading, StoredRow};
use time::{Duration, OffsetDateTime};

use super::{volume_deltas, Baseline};
use crate::sources::PriceQuote;

/// Why a cycle imported consumption without cost.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PriceSkip {
    #[error("no price source configured")]
    NotConfigured,
    #[error("price source has no current value")]
    Absent,
    #[error("price {0:?} is not a finite number")]
    NonNumeric(String),
    #[error("price {0} is not strictly positive")]
    NonPositive(f64),
    #[error("price observed {age_secs}s ago exceeds the {max_age_secs}s limit")]
    Stale { age_secs: i64, max_age_secs: i64 },
}

impl PriceSkip {
    /// Metric label value.
    pub fn label(&self) -> &'static str {
        match self {
            PriceSkip::NotConfigured => "not_configured",
            PriceSkip::Absent => "absent",
            PriceSkip::NonNumeric(_) => "non_numeric",
            PriceSkip::NonPositive(_) => "non_positive",
            PriceSkip::Stale { .. } => "stale",
        }
    }
}

/// Turn a raw quote into a usable unit price.
pub fn resolve_price(
    quote: Option<&PriceQuote>,
    now: OffsetDateTime,
    max_age: Option<Duration>,
) -> Result<f64, PriceSkip> {
    let quote = quote.ok_or(PriceSkip::Absent)?;
    let raw = quote
        .raw
        .as_deref()
        .map(str::trim)
        .filter(|raw| {
            !raw.is_empty()
                && !raw.eq_ignore_ascii_case("unknown")
                && !raw.eq_ignore_ascii_case("unavailable")
        })
        .ok_or(PriceSkip::Absent)?;

    let price: f64 = raw
        .parse()
        .ok()
        .filter(|p: &f64| p.is_finite())
        .ok_or_else(|| PriceSkip::NonNumeric(raw.to_string()))?;

    if price <= 0.0 {
        return Err(PriceSkip::NonPositive(price));
    }

    if let Some(max_age) = max_age {
        let age = now - quote.observed_at;
        if age > max_age {
            return Err(PriceSkip::Stale {
                age_secs: age.whole_seconds(),
                max_age_secs: max_age.whole_seconds(),
            });
        }
    }

    Ok(price)
}

/// Cumulative cost rows: every volume delta priced at `price_per_unit`.
/// `state` always equals `sum`.
pub fn to_cost_rows(
    readings: &[Reading],
    price_per_unit: f64,
    baseline: &Baseline,
) -> Vec<StoredRow> {
    let mut total = baseline.last_sum.unwrap_or(0.0);
    volume_deltas(readings, baseline.last_reading)
        .map(|(ts, _, delta)| {
            total += delta * price_per_unit;
            StoredRow::new(ts, total, total)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use statistics_client::domain::Unit;
    use time::macros::datetime;

    fn quote(raw: &str, observed_at: OffsetDateTime) -> PriceQuote {
        PriceQuote::new(raw, observed_at)
    }

    #[test]
    fn cost_rows_keep_state_equal_to_sum() {
        let t0 = datetime!(2026-01-01 00:00 UTC);
        let readings = vec![
            Reading::new(t0, 1000.0, Unit::Gallons),
            Reading::new(t0 + Duration::hours(1), 1010.0, Unit::Gallons),
            Reading::new(t0 + Duration::hours(2), 1014.0, Unit::Gallons),
        ];
        let baseline = Baseline {
            effective_last_time: None,
            last_reading: Some(990.0),
            last_sum: Some(2.0),
        };

        let rows = to_cost_rows(&readings, 0.5, &baseline);
        let sums: Vec<f64> = rows.iter().map(|r| r.sum).collect();
        assert_eq!(sums, vec![7.0, 12.0, 14.0]);
        assert!(rows.iter().all(|r| r.state == r.sum));
    }

    #[test]
    fn usable_price_is_parsed() {
        let now = datetime!(2026-01-01 12:00 UTC);
        let q = quote(" 0.0125 ", now - Duration::minutes(5));

        assert_eq!(resolve_price(Some(&q), now, Some(Duration::hours(1))), Ok(0.0125));
        assert_eq!(resolve_price(Some(&q), now, None), Ok(0.0125));
    }

    #[test]
    fn each_skip_reason_is_reported() {
        let now = datetime!(2026-01-01 12:00 UTC);

        assert_eq!(resolve_price(None, now, None), Err(PriceSkip::Absent));
        assert_eq!(
            resolve_price(Some(&quote("unavailable", now)), now, None),
            Err(PriceSkip::Absent)
        );
        assert_eq!(
            resolve_price(Some(&PriceQuote { raw: None, observed_at: now }), now, None),
            Err(PriceSkip::Absent)
        );
        assert_eq!(
            resolve_price(Some(&quote("cheap", now)), now, None),
            Err(PriceSkip::NonNumeric("cheap".to_string()))
        );
        assert_eq!(
            resolve_price(Some(&quote("NaN", now)), now, None),
            Err(PriceSkip::NonNumeric("NaN".to_string()))
        );
        assert_eq!(
            resolve_price(Some(&quote("0", now)), now, None),
            Err(PriceSkip::NonPositive(0.0))
        );
        assert_eq!(
            resolve_price(Some(&quote("-1.5", now)), now, None),
            Err(PriceSkip::NonPositive(-1.5))
        );

        let old = quote("0.01", now - Duration::hours(3));
        assert_eq!(
            resolve_price(Some(&old), now, Some(Duration::hours(1))),
            Err(PriceSkip::Stale {
                age_secs: 3 * 3600,
                max_age_secs: 3600
            })
        );
        assert_eq!(PriceSkip::NotConfigured.label(), "not_configured");
    }

    #[test]
    fn cost_never_falls_below_the_baseline_total() {
        let t0 = datetime!(2026-01-01 00:00 UTC);
        let readings = vec![
            Reading::new(t0, 98.0, Unit::Gallons),
            Reading::new(t0 + Duration::hours(1), 104.0, Unit::Gallons),
        ];
        let baseline = Baseline {
            effective_last_time: None,
            last_reading: Some(100.0),
            last_sum: Some(3.0),
        };

        let rows = to_cost_rows(&readings, 0.5, &baseline);
        let sums: Vec<f64> = rows.iter().map(|r| r.sum).collect();
        assert_eq!(sums, vec![3.0, 5.0]);
    }
}
