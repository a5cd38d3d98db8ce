use anyhow::{bail, Result};
use sqlx::postgres::PgPoolOptions;
use statistics_client::{
    db::statistics_queries,
    domain::{cost_series_name, series_name},
};
use statistics_service::{
    config::AppConfig,
    engine::{run_polling, EngineSettings, ImportOptions, Reconciler},
    metrics_server, observability,
    sources::{FixedPriceSource, HttpMeterSource, PriceSource},
    store::PgStatisticsStore,
};
use std::{sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    if cfg.meters.is_empty() {
        bail!("no meters configured");
    }

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.store.max_connections)
        .connect(&cfg.store.uri)
        .await?;
    statistics_queries::ensure_schema(&pool).await?;

    let store = Arc::new(PgStatisticsStore::from_config(pool, &cfg.store));
    let source = Arc::new(HttpMeterSource::new(
        &cfg.source.base_url,
        cfg.source.auth_bearer_token.clone(),
        Duration::from_secs(cfg.source.timeout_secs),
        cfg.source.metric,
    )?);
    let price = cfg.price.as_ref().map(|p| {
        tracing::info!(
            price_per_unit = p.price_per_unit,
            currency = %p.currency,
            "cost statistics enabled"
        );
        Arc::new(FixedPriceSource::new(p.price_per_unit)) as Arc<dyn PriceSource>
    });

    let reconciler = Arc::new(Reconciler::new(
        store,
        source,
        price,
        EngineSettings::from_config(&cfg.engine, cfg.price.as_ref()),
    ));

    for meter_id in &cfg.meters {
        tracing::info!(
            meter_id = %meter_id,
            series = %series_name(meter_id),
            cost_series = ?cfg.price.as_ref().map(|_| cost_series_name(meter_id)),
            "tracking meter"
        );
    }
    tracing::info!(
        meters = cfg.meters.len(),
        poll_interval_secs = cfg.engine.poll_interval_secs,
        "statistics service started"
    );

    let initial = ImportOptions {
        lookback_days: Some(cfg.engine.initial_lookback_days),
        ..ImportOptions::default()
    };
    run_polling(
        reconciler,
        cfg.meters.clone(),
        Duration::from_secs(cfg.engine.poll_interval_secs.max(1)),
        initial,
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        },
    )
    .await;

    Ok(())
}
