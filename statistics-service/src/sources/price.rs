use time::OffsetDateTime;

/// Raw price observation as published by a price feed. Validation happens in
/// [`crate::transform::cost::resolve_price`].
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub raw: Option<String>,
    pub observed_at: OffsetDateTime,
}

impl PriceQuote {
    pub fn new(raw: impl Into<String>, observed_at: OffsetDateTime) -> Self {
        Self {
            raw: Some(raw.into()),
            observed_at,
        }
    }
}

#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    async fn current_price(&self) -> Option<PriceQuote>;
}

/// Constant unit price from configuration; always observed "now".
#[derive(Debug, Clone)]
pub struct FixedPriceSource {
    price_per_unit: f64,
}

impl FixedPriceSource {
    pub fn new(price_per_unit: f64) -> Self {
        Self { price_per_unit }
    }
}

#[async_trait::async_trait]
impl PriceSource for FixedPriceSource {
    async fn current_price(&self) -> Option<PriceQuote> {
        Some(PriceQuote::new(self.price_per_unit.to_string(), OffsetDateTime::now_utc()))
    }
}
