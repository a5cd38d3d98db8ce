use anyhow::{bail, Result};
use sqlx::postgres::PgPoolOptions;
use statistics_client::domain::SeriesId;
use statistics_service::{
    config::AppConfig,
    engine::{reset_series, resolve_series_id, validate_monotonic},
    observability,
    store::PgStatisticsStore,
};
use std::env;
use time::{Duration, OffsetDateTime};

const USAGE: &str = "usage:
  statistics_tools validate <meter_id|series_id> [hours]
  statistics_tools reset <meter_id|series_id> <confirmation>";

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let (Some(command), Some(target)) = (args.first(), args.get(1)) else {
        bail!(USAGE);
    };
    let Some(series) = target_series(target) else {
        bail!(USAGE);
    };

    let cfg = AppConfig::load()?;
    let pool = PgPoolOptions::new()
        .max_connections(cfg.store.max_connections)
        .connect(&cfg.store.uri)
        .await?;
    let store = PgStatisticsStore::from_config(pool, &cfg.store);

    match command.as_str() {
        "validate" => {
            let window = match args.get(2) {
                Some(hours) => Some(Duration::hours(hours.parse()?)),
                None => None,
            };
            let now = OffsetDateTime::now_utc();
            let report = validate_monotonic(&store, &series, window, now).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_monotonic() {
                bail!("{} has {} decreasing sums", series, report.violations.len());
            }
        }
        "reset" => {
            let Some(confirmation) = args.get(2) else {
                bail!("reset is destructive: repeat the series id '{series}' as confirmation");
            };
            let deleted = reset_series(&store, &series, confirmation).await?;
            println!("deleted {deleted} rows from {series}");
        }
        other => bail!("unknown command '{other}'\n{USAGE}"),
    }

    Ok(())
}

fn target_series(target: &str) -> Option<SeriesId> {
    resolve_series_id(None, Some(target), Some(target))
}
