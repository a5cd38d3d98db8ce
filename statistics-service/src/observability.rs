use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` overrides the default
/// `info` level for the statistics crates.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("statistics_service=info,statistics_client=info"));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
