use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use statistics_client::domain::{Reading, SeriesId, StoredRow};
use time::{Duration, OffsetDateTime};
use tokio::sync::OwnedMutexGuard;

use super::{
    audit,
    backfill::{is_backfill, resolve_import_base},
    baseline::{resolve_baseline, ResolveParams},
    repair::write_carry_forward,
    ReconcileError,
};
use crate::{
    config::{EngineConfig, PriceConfig},
    sources::{FetchError, MeterSource, PriceSource},
    store::StatisticsStore,
    transform::{
        accept_valid, filter_newer, normalize, resolve_price, to_cost_rows, to_delta_rows,
        validate_reading, Baseline, PriceSkip,
    },
};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub lookback_days: u32,
    /// Bounds every "row before" lookup: trusted rows and backfill bases.
    pub history_lookback: Duration,
    pub sum_tolerance: f64,
    pub price_max_age: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default(), None)
    }
}

impl EngineSettings {
    pub fn from_config(engine: &EngineConfig, price: Option<&PriceConfig>) -> Self {
        Self {
            lookback_days: engine.lookback_days,
            history_lookback: Duration::days(i64::from(engine.backfill_lookback_days)),
            sum_tolerance: engine.sum_tolerance,
            price_max_age: price
                .and_then(|p| p.max_age_secs)
                .map(|secs| Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Ignore the resolved baseline and re-import every fetched reading.
    pub force_overwrite: bool,
    /// Delete rows beyond the new tip instead of sealing them.
    pub purge_downstream: bool,
    /// Overrides the configured lookback for this cycle.
    pub lookback_days: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImportedTip {
    pub time: OffsetDateTime,
    pub state: f64,
    pub sum: f64,
}

impl From<&StoredRow> for ImportedTip {
    fn from(row: &StoredRow) -> Self {
        Self {
            time: row.start,
            state: row.state,
            sum: row.sum,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportResult {
    pub points_imported: usize,
    pub cost_points_imported: usize,
    pub repaired: bool,
    pub backfill: bool,
    pub cost_skipped: Option<PriceSkip>,
    pub tip: Option<ImportedTip>,
}

/// Per-meter cache the engine keeps between cycles. Never authoritative:
/// the store always wins when they disagree.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceMemory {
    pub last_imported: Option<OffsetDateTime>,
    pub display_state: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Uninitialized,
    BaselineResolved,
    NormalImport,
    BackfillImport,
    NoNewData,
    Sealed,
}

/// At most one cycle per meter; a second trigger is refused, not queued.
#[derive(Default)]
struct SingleFlight {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SingleFlight {
    fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.try_lock_owned().ok()
    }
}

pub struct Reconciler {
    store: Arc<dyn StatisticsStore>,
    source: Arc<dyn MeterSource>,
    price: Option<Arc<dyn PriceSource>>,
    settings: EngineSettings,
    memory: Mutex<HashMap<String, DeviceMemory>>,
    flights: SingleFlight,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StatisticsStore>,
        source: Arc<dyn MeterSource>,
        price: Option<Arc<dyn PriceSource>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            source,
            price,
            settings,
            memory: Mutex::new(HashMap::new()),
            flights: SingleFlight::default(),
        }
    }

    pub fn memory(&self, meter_id: &str) -> DeviceMemory {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(meter_id)
            .copied()
            .unwrap_or_default()
    }

    fn update_memory(&self, meter_id: &str, f: impl FnOnce(&mut DeviceMemory)) {
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        f(memory.entry(meter_id.to_string()).or_default());
    }

    /// Bring the meter's statistics up to date with the metering source.
    pub async fn reconcile(
        &self,
        meter_id: &str,
        options: ImportOptions,
    ) -> Result<ImportResult, ReconcileError> {
        let _flight = self
            .flights
            .try_acquire(meter_id)
            .ok_or_else(|| ReconcileError::InFlight(meter_id.to_string()))?;

        let started = Instant::now();
        let result = self.run(meter_id, options).await;
        metrics::histogram!("statistics_reconcile_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Delete a meter's series after confirmation and forget its memory.
    pub async fn reset_meter(
        &self,
        meter_id: &str,
        confirmation: &str,
    ) -> Result<u64, ReconcileError> {
        let _flight = self
            .flights
            .try_acquire(meter_id)
            .ok_or_else(|| ReconcileError::InFlight(meter_id.to_string()))?;

        let series = SeriesId::consumption(meter_id);
        let mut deleted = audit::reset_series(self.store.as_ref(), &series, confirmation).await?;
        if self.price.is_some() {
            deleted += self.store.delete_series(&SeriesId::cost(meter_id)).await?;
        }

        self.update_memory(meter_id, |memory| *memory = DeviceMemory::default());
        Ok(deleted)
    }

    async fn run(
        &self,
        meter_id: &str,
        options: ImportOptions,
    ) -> Result<ImportResult, ReconcileError> {
        let series = SeriesId::consumption(meter_id);
        let cost_series = self.price.as_ref().map(|_| SeriesId::cost(meter_id));
        let lookback_days = options.lookback_days.unwrap_or(self.settings.lookback_days);
        enter(meter_id, CyclePhase::Uninitialized);

        let fetched = self.fetch_readings(meter_id, lookback_days).await?;
        let live_reading = self.fetch_live_reading(meter_id).await?;
        let readings = normalize(&accept_valid(meter_id, fetched));

        let memory = self.memory(meter_id);
        let resolution = resolve_baseline(
            self.store.as_ref(),
            &ResolveParams {
                series: &series,
                cost_series: cost_series.as_ref(),
                memory_time: memory.last_imported,
                live_reading,
                tolerance: self.settings.sum_tolerance,
                anchor_lookback: self.settings.history_lookback,
            },
        )
        .await?;
        enter(meter_id, CyclePhase::BaselineResolved);

        let repaired = resolution.repaired();
        let store_tip = resolution.store_tip;
        let mut baseline = resolution.baseline;

        if store_tip.is_none() && memory != DeviceMemory::default() {
            tracing::info!(meter_id, "no stored statistics, clearing the meter's memory");
            self.update_memory(meter_id, |memory| *memory = DeviceMemory::default());
        }

        if options.force_overwrite {
            tracing::warn!(
                meter_id,
                "force overwrite requested, re-importing every fetched reading"
            );
            baseline = Baseline::default();
        }

        let mut new_readings = filter_newer(&readings, baseline.effective_last_time);
        if new_readings.is_empty() {
            let last_time = baseline.effective_last_time;
            if let (Some(last_time), Some(newest)) = (last_time, readings.last()) {
                if newest.ts < last_time {
                    tracing::warn!(
                        meter_id,
                        baseline = %last_time,
                        newest_reading = %newest.ts,
                        "baseline is past every fetched reading, re-importing the fetched window"
                    );
                    baseline = Baseline::default();
                    new_readings = readings.clone();
                }
            }
        }

        let Some(first_ts) = new_readings.first().map(|r| r.ts) else {
            enter(meter_id, CyclePhase::NoNewData);
            self.resync_display(meter_id, store_tip.as_ref());
            enter(meter_id, CyclePhase::Sealed);
            return Ok(ImportResult {
                repaired,
                tip: store_tip.as_ref().map(ImportedTip::from),
                ..ImportResult::default()
            });
        };

        let backfill = is_backfill(first_ts, store_tip.as_ref());
        let base = if backfill {
            enter(meter_id, CyclePhase::BackfillImport);
            let lookback = self.settings.history_lookback;
            Baseline::from(
                resolve_import_base(self.store.as_ref(), &series, first_ts, lookback).await?,
            )
        } else {
            enter(meter_id, CyclePhase::NormalImport);
            baseline
        };

        let rows = to_delta_rows(&new_readings, &base);
        self.store.upsert(&series, &rows).await?;
        metrics::counter!("statistics_rows_imported_total", "series" => series.to_string())
            .increment(rows.len() as u64);

        let (cost_rows, cost_skipped) = match &cost_series {
            Some(cost_series) => {
                self.import_cost(meter_id, cost_series, &new_readings, &base, backfill)
                    .await?
            }
            None => (Vec::new(), Some(PriceSkip::NotConfigured)),
        };

        let Some(new_tip) = rows.last().copied() else {
            return Ok(ImportResult::default());
        };
        self.seal(
            meter_id,
            &series,
            cost_series.as_ref(),
            &new_tip,
            cost_rows.last(),
            store_tip.as_ref(),
            options,
        )
        .await?;
        enter(meter_id, CyclePhase::Sealed);

        self.update_memory(meter_id, |memory| {
            memory.last_imported = Some(new_tip.start);
            memory.display_state = Some(new_tip.state);
        });
        metrics::gauge!("statistics_display_state", "meter_id" => meter_id.to_string())
            .set(new_tip.state);

        tracing::info!(
            meter_id,
            points = rows.len(),
            cost_points = cost_rows.len(),
            backfill,
            repaired,
            tip = %new_tip.start,
            sum = new_tip.sum,
            "imported statistics"
        );

        Ok(ImportResult {
            points_imported: rows.len(),
            cost_points_imported: cost_rows.len(),
            repaired,
            backfill,
            cost_skipped,
            tip: Some(ImportedTip::from(&new_tip)),
        })
    }

    async fn fetch_readings(
        &self,
        meter_id: &str,
        lookback_days: u32,
    ) -> Result<Vec<Reading>, ReconcileError> {
        match self.source.fetch_readings(meter_id, lookback_days).await {
            Ok(readings) => Ok(readings),
            Err(FetchError::EmptyBody(reason)) if lookback_days > 1 => {
                tracing::warn!(
                    meter_id,
                    lookback_days,
                    reason = %reason,
                    "metering source returned an empty body, retrying with a 1-day lookback"
                );
                match self.source.fetch_readings(meter_id, 1).await {
                    Ok(readings) => Ok(readings),
                    Err(FetchError::Auth(reason)) => Err(ReconcileError::AuthFailure(reason)),
                    Err(e) => {
                        tracing::warn!(
                            meter_id,
                            error = %e,
                            "1-day fallback fetch failed, continuing without new readings"
                        );
                        Ok(Vec::new())
                    }
                }
            }
            Err(FetchError::EmptyBody(reason)) => {
                tracing::info!(
                    meter_id,
                    reason = %reason,
                    "no readings published for the requested day"
                );
                Ok(Vec::new())
            }
            Err(FetchError::Auth(reason)) => Err(ReconcileError::AuthFailure(reason)),
            Err(FetchError::Transient(reason)) => Err(ReconcileError::TransientFetchFailure {
                meter_id: meter_id.to_string(),
                reason,
            }),
        }
    }

    async fn fetch_live_reading(&self, meter_id: &str) -> Result<Option<f64>, ReconcileError> {
        match self.source.fetch_live_snapshot(meter_id).await {
            Ok(reading) if validate_reading(&reading).is_ok() => Ok(Some(reading.value)),
            Ok(reading) => {
                tracing::debug!(meter_id, value = reading.value, "ignoring invalid live reading");
                Ok(None)
            }
            Err(FetchError::Auth(reason)) => Err(ReconcileError::AuthFailure(reason)),
            Err(e) => {
                tracing::debug!(meter_id, error = %e, "live reading unavailable");
                Ok(None)
            }
        }
    }

    async fn import_cost(
        &self,
        meter_id: &str,
        cost_series: &SeriesId,
        readings: &[Reading],
        base: &Baseline,
        backfill: bool,
    ) -> Result<(Vec<StoredRow>, Option<PriceSkip>), ReconcileError> {
        let quote = match &self.price {
            Some(price) => price.current_price().await,
            None => return Ok((Vec::new(), Some(PriceSkip::NotConfigured))),
        };

        let now = OffsetDateTime::now_utc();
        let price = match resolve_price(quote.as_ref(), now, self.settings.price_max_age) {
            Ok(price) => price,
            Err(skip) => {
                metrics::counter!("statistics_cost_skipped_total", "reason" => skip.label())
                    .increment(1);
                tracing::info!(meter_id, reason = %skip, "skipping cost import for this cycle");
                return Ok((Vec::new(), Some(skip)));
            }
        };

        let lookback = self.settings.history_lookback;
        let cost_sum = match readings.first() {
            Some(first) if backfill => {
                resolve_import_base(self.store.as_ref(), cost_series, first.ts, lookback)
                    .await?
                    .sum
            }
            _ => self.store.last_row(cost_series).await?.map(|row| row.sum),
        };

        let cost_base = Baseline {
            effective_last_time: None,
            last_reading: base.last_reading,
            last_sum: cost_sum,
        };
        let rows = to_cost_rows(readings, price, &cost_base);
        self.store.upsert(cost_series, &rows).await?;
        metrics::counter!("statistics_rows_imported_total", "series" => cost_series.to_string())
            .increment(rows.len() as u64);

        Ok((rows, None))
    }

    /// Keep rows past the new tip from undercutting it.
    #[allow(clippy::too_many_arguments)]
    async fn seal(
        &self,
        meter_id: &str,
        series: &SeriesId,
        cost_series: Option<&SeriesId>,
        new_tip: &StoredRow,
        cost_tip: Option<&StoredRow>,
        old_tip: Option<&StoredRow>,
        options: ImportOptions,
    ) -> Result<(), ReconcileError> {
        if options.purge_downstream {
            let mut deleted = self.store.delete_rows_after(series, new_tip.start).await?;
            if let Some(cost_series) = cost_series {
                deleted += self.store.delete_rows_after(cost_series, new_tip.start).await?;
            }
            if deleted > 0 {
                tracing::warn!(
                    meter_id,
                    after = %new_tip.start,
                    deleted,
                    "purged statistics beyond the imported tip"
                );
            }
            return Ok(());
        }

        let Some(old_tip) = old_tip.filter(|old| old.start > new_tip.start) else {
            return Ok(());
        };

        let store = self.store.as_ref();
        write_carry_forward(
            store,
            series,
            new_tip.start,
            old_tip.start,
            new_tip.state,
            new_tip.sum,
        )
        .await?;
        if let (Some(cost_series), Some(cost_tip)) = (cost_series, cost_tip) {
            write_carry_forward(
                store,
                cost_series,
                cost_tip.start,
                old_tip.start,
                cost_tip.sum,
                cost_tip.sum,
            )
            .await?;
        }
        Ok(())
    }

    fn resync_display(&self, meter_id: &str, store_tip: Option<&StoredRow>) {
        let Some(tip) = store_tip else {
            return;
        };
        let current = self.memory(meter_id).display_state;
        let tolerance = self.settings.sum_tolerance;
        let diverged = current.map_or(true, |shown| (shown - tip.state).abs() > tolerance);
        if diverged {
            tracing::debug!(
                meter_id,
                shown = ?current,
                stored = tip.state,
                "resyncing display state from the store"
            );
            self.update_memory(meter_id, |memory| memory.display_state = Some(tip.state));
            metrics::gauge!("statistics_display_state", "meter_id" => meter_id.to_string())
                .set(tip.state);
        }
    }
}

fn enter(meter_id: &str, phase: CyclePhase) {
    tracing::debug!(meter_id, phase = ?phase, "reconcile phase");
}
