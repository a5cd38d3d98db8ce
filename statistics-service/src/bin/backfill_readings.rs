use anyhow::{bail, Result};
use sqlx::postgres::PgPoolOptions;
use statistics_client::{db::statistics_queries, domain::SeriesId};
use statistics_service::{
    config::AppConfig,
    engine::{EngineSettings, ImportOptions, Reconciler},
    observability,
    sources::{CsvReadingSource, FixedPriceSource, PriceSource},
    store::{MemoryStore, PgStatisticsStore, StatisticsStore},
};
use std::{env, sync::Arc};

const FLAGS: [&str; 4] = ["--dry-run", "--metric", "--force-overwrite", "--purge-downstream"];
const USAGE: &str = "usage: backfill_readings <csv_file_path> \
[--dry-run] [--metric] [--force-overwrite] [--purge-downstream]";

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(file_path) = args.iter().find(|a| !a.starts_with("--")) else {
        bail!(USAGE);
    };
    let flag = |name: &str| args.iter().any(|a| a == name);
    if let Some(unknown) = args
        .iter()
        .filter(|a| a.starts_with("--"))
        .find(|a| !FLAGS.contains(&a.as_str()))
    {
        bail!("unknown flag {unknown}\n{USAGE}");
    }
    let dry_run = flag("--dry-run");

    // A dry run needs no configuration; STATISTICS_CONFIG is only read for real imports.
    let cfg = if dry_run { None } else { Some(AppConfig::load()?) };
    let metric = cfg.as_ref().map_or(flag("--metric"), |c| c.source.metric);

    let memory_store = Arc::new(MemoryStore::new());
    let store: Arc<dyn StatisticsStore> = match &cfg {
        Some(cfg) => {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.store.max_connections)
                .connect(&cfg.store.uri)
                .await?;
            statistics_queries::ensure_schema(&pool).await?;
            Arc::new(PgStatisticsStore::from_config(pool, &cfg.store))
        }
        None => Arc::clone(&memory_store) as Arc<dyn StatisticsStore>,
    };

    let price_cfg = cfg.as_ref().and_then(|c| c.price.as_ref());
    let price = price_cfg
        .map(|p| Arc::new(FixedPriceSource::new(p.price_per_unit)) as Arc<dyn PriceSource>);
    let settings = match &cfg {
        Some(cfg) => EngineSettings::from_config(&cfg.engine, price_cfg),
        None => EngineSettings::default(),
    };

    let source = Arc::new(CsvReadingSource::new(file_path, metric));
    let meters = source.meter_ids().await?;
    if meters.is_empty() {
        bail!("no readings found in {file_path}");
    }

    let reconciler = Reconciler::new(store, source, price, settings);
    let options = ImportOptions {
        force_overwrite: flag("--force-overwrite"),
        purge_downstream: flag("--purge-downstream"),
        lookback_days: Some(u32::MAX),
    };

    for meter_id in &meters {
        let result = reconciler.reconcile(meter_id, options).await?;
        tracing::info!(
            meter_id = %meter_id,
            points = result.points_imported,
            cost_points = result.cost_points_imported,
            backfill = result.backfill,
            repaired = result.repaired,
            "backfilled meter"
        );

        if dry_run {
            let series = SeriesId::consumption(meter_id);
            println!("{}", serde_json::to_string_pretty(&memory_store.rows(&series))?);
        }
    }

    Ok(())
}
