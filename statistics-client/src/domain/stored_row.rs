use time::OffsetDateTime;

/// One hour of a cumulative series: the absolute `state` at `start` and the
/// running `sum` the series has accumulated up to and including that hour.
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StoredRow {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub start: OffsetDateTime,
    pub state: f64,
    pub sum: f64,
}

impl StoredRow {
    pub fn new(start: OffsetDateTime, state: f64, sum: f64) -> Self {
        Self { start, state, sum }
    }
}
