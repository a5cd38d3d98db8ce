use statistics_client::domain::{SeriesId, StoredRow};
use time::{Duration, OffsetDateTime};

use super::repair::{self, RepairKind, RepairReport};
use crate::{
    store::{StatisticsStore, StoreError},
    transform::Baseline,
};

/// Inputs of one baseline resolution.
#[derive(Debug, Clone)]
pub struct ResolveParams<'a> {
    pub series: &'a SeriesId,
    pub cost_series: Option<&'a SeriesId>,
    /// Last instant this engine imported for the meter, if any.
    pub memory_time: Option<OffsetDateTime>,
    pub live_reading: Option<f64>,
    pub tolerance: f64,
    /// How far before `memory_time` a trusted row may lie.
    pub anchor_lookback: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub baseline: Baseline,
    /// Latest consumption row after any repair.
    pub store_tip: Option<StoredRow>,
    pub repairs: Vec<RepairReport>,
}

impl Resolution {
    pub fn repaired(&self) -> bool {
        !self.repairs.is_empty()
    }
}

/// Decide where the next import continues from, repairing the consumption
/// series (and mirroring onto the cost series) when its tail is inconsistent.
pub async fn resolve_baseline(
    store: &dyn StatisticsStore,
    params: &ResolveParams<'_>,
) -> Result<Resolution, StoreError> {
    let series = params.series;

    let Some(mut tip) = store.last_row(series).await? else {
        if let Some(memory_time) = params.memory_time {
            tracing::warn!(
                series = %series,
                last_imported = %memory_time,
                "statistics store has no rows for an imported series, re-importing from scratch"
            );
        }
        return Ok(Resolution::default());
    };

    let mut baseline = Baseline::from_row(&tip);
    let mut repairs = Vec::new();

    if let Some(memory_time) = params.memory_time {
        if tip.start < memory_time {
            tracing::info!(
                series = %series,
                store_tip = %tip.start,
                last_imported = %memory_time,
                "statistics store lags the last import, continuing from its latest row"
            );
        } else if tip.start > memory_time {
            let before = memory_time + Duration::nanoseconds(1);
            let not_before = memory_time - params.anchor_lookback;
            match store.last_row_before(series, before, not_before).await? {
                Some(trusted) if repair::sums_diverge(&trusted, &tip, params.tolerance) => {
                    let rows_written = repair::write_carry_forward(
                        store,
                        series,
                        trusted.start,
                        tip.start,
                        trusted.state,
                        trusted.sum,
                    )
                    .await?;
                    repairs.push(RepairReport {
                        kind: RepairKind::StoreAhead,
                        series: series.clone(),
                        from: trusted.start,
                        through: tip.start,
                        state: trusted.state,
                        sum: trusted.sum,
                        rows_written,
                    });
                    tip = StoredRow::new(tip.start, trusted.state, trusted.sum);
                    baseline = Baseline::from_row(&tip);
                }
                _ => {
                    tracing::debug!(
                        series = %series,
                        store_tip = %tip.start,
                        "store ahead of the last import with consistent sums"
                    );
                }
            }
        }
    }

    if let Some(max_row) = store.row_with_max_sum(series).await? {
        if repair::exceeds_tip(&max_row, &tip, params.tolerance) {
            let (state, sum) = repair::carried_values(&max_row, params.live_reading);
            let rows_written =
                repair::write_carry_forward(store, series, max_row.start, tip.start, state, sum)
                    .await?;
            repairs.push(RepairReport {
                kind: RepairKind::TailReset,
                series: series.clone(),
                from: max_row.start,
                through: tip.start,
                state,
                sum,
                rows_written,
            });
            tip = StoredRow::new(tip.start, state, sum);
            baseline = Baseline::from_row(&tip);
        }
    }

    if !repairs.is_empty() {
        if let Some(cost_series) = params.cost_series {
            let mirrored =
                mirror_cost_repair(store, cost_series, tip.start, params.tolerance).await?;
            if let Some(report) = mirrored {
                repairs.push(report);
            }
        }
    }

    Ok(Resolution {
        baseline,
        store_tip: Some(tip),
        repairs,
    })
}

/// Flatten the cost series from its own max-sum anchor through `through`.
async fn mirror_cost_repair(
    store: &dyn StatisticsStore,
    cost_series: &SeriesId,
    through: OffsetDateTime,
    tolerance: f64,
) -> Result<Option<RepairReport>, StoreError> {
    let cost_tip = store.last_row(cost_series).await?;
    let anchor = store.row_with_max_sum(cost_series).await?;
    let (Some(cost_tip), Some(anchor)) = (cost_tip, anchor) else {
        return Ok(None);
    };

    if !repair::exceeds_tip(&anchor, &cost_tip, tolerance) {
        return Ok(None);
    }

    let through = through.max(cost_tip.start);
    let rows_written = repair::write_carry_forward(
        store,
        cost_series,
        anchor.start,
        through,
        anchor.sum,
        anchor.sum,
    )
    .await?;

    Ok(Some(RepairReport {
        kind: RepairKind::CostMirror,
        series: cost_series.clone(),
        from: anchor.start,
        through,
        state: anchor.sum,
        sum: anchor.sum,
        rows_written,
    }))
}
