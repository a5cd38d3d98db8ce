use statistics_client::domain::Reading;

pub mod csv_file;
pub mod http_json;
pub mod price;

pub use csv_file::CsvReadingSource;
pub use http_json::HttpMeterSource;
pub use price::{FixedPriceSource, PriceQuote, PriceSource};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("metering source rejected the credentials: {0}")]
    Auth(String),
    #[error("metering source returned an empty body: {0}")]
    EmptyBody(String),
    #[error("metering source request failed: {0}")]
    Transient(String),
}

/// Vendor metering API for one account.
///
/// Readings are absolute meter values, ascending by timestamp, already
/// converted into the account's canonical unit.
#[async_trait::async_trait]
pub trait MeterSource: Send + Sync {
    async fn fetch_readings(
        &self,
        meter_id: &str,
        lookback_days: u32,
    ) -> Result<Vec<Reading>, FetchError>;

    async fn fetch_live_snapshot(&self, meter_id: &str) -> Result<Reading, FetchError>;
}
