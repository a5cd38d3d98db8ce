use std::net::SocketAddr;

use anyhow::Context;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder and serve `/metrics` on `bind_addr`.
pub fn init(bind_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid metrics bind address '{bind_addr}'"))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;

    let _ = PROM_HANDLE.set(handle);
    describe_metrics();

    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(metrics_handler));

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind metrics listener");
            }
        }
    });

    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        "statistics_rows_imported_total",
        "Rows upserted by imports, per series"
    );
    metrics::describe_counter!(
        "statistics_repair_rows_total",
        "Carry-forward rows written, per series"
    );
    metrics::describe_counter!(
        "statistics_readings_rejected_total",
        "Readings dropped by validation"
    );
    metrics::describe_counter!(
        "statistics_cost_skipped_total",
        "Cycles that imported no cost, per reason"
    );
    metrics::describe_counter!(
        "statistics_cycle_failures_total",
        "Failed meter cycles, per error kind"
    );
    metrics::describe_counter!(
        "statistics_store_retry_total",
        "Store writes retried after an error"
    );
    metrics::describe_counter!("statistics_store_errors_total", "Store calls that failed for good");
    metrics::describe_counter!("statistics_csv_parse_errors_total", "Unparseable CSV records");
    metrics::describe_gauge!("statistics_display_state", "Last absolute reading shown per meter");
    metrics::describe_histogram!(
        "statistics_reconcile_duration_seconds",
        "Duration of one meter cycle"
    );
}

async fn metrics_handler() -> String {
    PROM_HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}
