use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub uri: String,
    pub max_connections: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_batch_size() -> usize {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_secs: u64,
    pub lookback_days: u32,
    /// Lookback for the first cycle after startup.
    pub initial_lookback_days: u32,
    pub backfill_lookback_days: u32,
    pub sum_tolerance: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 900,
            lookback_days: 3,
            initial_lookback_days: 30,
            backfill_lookback_days: 365,
            sum_tolerance: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    pub auth_bearer_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Account reports cubic meters instead of imperial units.
    #[serde(default)]
    pub metric: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceConfig {
    pub price_per_unit: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub max_age_secs: Option<u64>,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub source: SourceConfig,
    pub price: Option<PriceConfig>,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub meters: Vec<String>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("STATISTICS_CONFIG")
            .unwrap_or_else(|_| "statistics-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        Ok(cfg)
    }
}
