use std::{future::Future, sync::Arc, time::Duration};

use tokio::{task::JoinSet, time::MissedTickBehavior};

use super::{ImportOptions, ReconcileError, Reconciler};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Meters whose previous cycle was still running.
    pub skipped: usize,
    pub points_imported: usize,
}

/// Reconcile every meter concurrently.
///
/// Per-meter failures are logged and counted. An authentication failure
/// aborts the remaining meters and is returned, since no meter can succeed
/// until the account is re-authenticated.
pub async fn run_cycle(
    reconciler: &Arc<Reconciler>,
    meters: &[String],
    options: ImportOptions,
) -> Result<CycleSummary, ReconcileError> {
    let mut tasks = JoinSet::new();
    for meter_id in meters {
        let reconciler = Arc::clone(reconciler);
        let meter_id = meter_id.clone();
        tasks.spawn(async move {
            let result = reconciler.reconcile(&meter_id, options).await;
            (meter_id, result)
        });
    }

    let mut summary = CycleSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((meter_id, Ok(result))) => {
                summary.succeeded += 1;
                summary.points_imported += result.points_imported;
                tracing::debug!(meter_id, points = result.points_imported, "meter reconciled");
            }
            Ok((_, Err(ReconcileError::AuthFailure(reason)))) => {
                tasks.abort_all();
                metrics::counter!("statistics_cycle_failures_total", "kind" => "auth").increment(1);
                tracing::error!(
                    reason = %reason,
                    "metering credentials rejected, re-authenticate to resume statistics"
                );
                return Err(ReconcileError::AuthFailure(reason));
            }
            Ok((meter_id, Err(ReconcileError::InFlight(_)))) => {
                summary.skipped += 1;
                tracing::debug!(meter_id, "previous cycle still running, trigger dropped");
            }
            Ok((meter_id, Err(e))) => {
                summary.failed += 1;
                metrics::counter!("statistics_cycle_failures_total", "kind" => e.kind())
                    .increment(1);
                tracing::error!(meter_id, error = %e, "reconciliation failed, retrying next cycle");
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!(error = %e, "reconciliation task did not complete");
            }
        }
    }

    Ok(summary)
}

/// Run a cycle on every tick until `shutdown` resolves.
///
/// The first tick fires immediately and uses `initial` options. Cycles are
/// spawned rather than awaited, so a slow meter never delays the ticker;
/// overlapping triggers for the same meter are dropped by the reconciler.
pub async fn run_polling<F>(
    reconciler: Arc<Reconciler>,
    meters: Vec<String>,
    interval: Duration,
    initial: ImportOptions,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let meters: Arc<[String]> = meters.into();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles: JoinSet<Result<CycleSummary, ReconcileError>> = JoinSet::new();
    let mut options = initial;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(in_flight = cycles.len(), "shutdown requested, stopping polling");
                cycles.shutdown().await;
                return;
            }
            _ = ticker.tick() => {
                let reconciler = Arc::clone(&reconciler);
                let meters = Arc::clone(&meters);
                cycles.spawn(async move { run_cycle(&reconciler, &meters, options).await });
                options = ImportOptions::default();
            }
            Some(done) = cycles.join_next(), if !cycles.is_empty() => {
                match done {
                    Ok(Ok(summary)) => tracing::info!(
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        points = summary.points_imported,
                        "polling cycle finished"
                    ),
                    Ok(Err(e)) => tracing::error!(error = %e, "polling cycle aborted"),
                    Err(e) => tracing::error!(error = %e, "polling cycle task did not complete"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::EngineSettings,
        sources::{FetchError, MeterSource},
        store::{MemoryStore, StatisticsStore},
    };
    use statistics_client::domain::{Reading, SeriesId, Unit};
    use time::macros::datetime;

    /// Fails auth for one meter, serves two readings for every other.
    struct AccountSource {
        locked_meter: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl MeterSource for AccountSource {
        async fn fetch_readings(
            &self,
            meter_id: &str,
            _lookback_days: u32,
        ) -> Result<Vec<Reading>, FetchError> {
            if self.locked_meter == Some(meter_id) {
                return Err(FetchError::Auth("session expired".to_string()));
            }
            Ok(vec![
                Reading::new(datetime!(2026-03-01 00:00 UTC), 10.0, Unit::Gallons),
                Reading::new(datetime!(2026-03-01 01:00 UTC), 12.0, Unit::Gallons),
            ])
        }

        async fn fetch_live_snapshot(&self, _meter_id: &str) -> Result<Reading, FetchError> {
            Err(FetchError::Transient("unsupported".to_string()))
        }
    }

    fn reconciler(store: &Arc<MemoryStore>, locked_meter: Option<&'static str>) -> Arc<Reconciler> {
        Arc::new(Reconciler::new(
            Arc::clone(store) as Arc<dyn StatisticsStore>,
            Arc::new(AccountSource { locked_meter }),
            None,
            EngineSettings::default(),
        ))
    }

    #[tokio::test]
    async fn cycle_reconciles_every_meter() {
        let store = Arc::new(MemoryStore::new());
        let engine = reconciler(&store, None);
        let meters = vec!["a".to_string(), "b".to_string()];

        let summary = run_cycle(&engine, &meters, ImportOptions::default()).await.unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.points_imported, 4);
        assert_eq!(store.rows(&SeriesId::consumption("b")).len(), 2);
    }

    #[tokio::test]
    async fn auth_failure_aborts_the_cycle() {
        let store = Arc::new(MemoryStore::new());
        let engine = reconciler(&store, Some("b"));
        let meters = vec!["a".to_string(), "b".to_string()];

        let res = run_cycle(&engine, &meters, ImportOptions::default()).await;

        assert_eq!(res, Err(ReconcileError::AuthFailure("session expired".to_string())));
    }

    #[tokio::test]
    async fn polling_runs_an_initial_cycle_and_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let engine = reconciler(&store, None);

        run_polling(
            Arc::clone(&engine),
            vec!["a".to_string()],
            Duration::from_secs(3600),
            ImportOptions::default(),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await;

        assert_eq!(store.rows(&SeriesId::consumption("a")).len(), 2);
    }
}
