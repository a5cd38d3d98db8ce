use std::fmt;

pub const SERIES_ID_PREFIX: &str = "sensor.water_meter_";
const SERIES_NAME_PREFIX: &str = "Water Meter";

/// Lowercase ASCII alphanumerics; every other character becomes `_`.
pub fn normalize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Key of one cumulative statistics series in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct SeriesId(String);

impl SeriesId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Volume series for a meter.
    pub fn consumption(meter_id: &str) -> Self {
        Self(format!("{SERIES_ID_PREFIX}{}", normalize_id(meter_id)))
    }

    /// Currency series derived from the same meter's readings.
    pub fn cost(meter_id: &str) -> Self {
        Self(format!("{SERIES_ID_PREFIX}{}_cost", normalize_id(meter_id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn series_name(meter_id: &str) -> String {
    format!("{SERIES_NAME_PREFIX} {}", normalize_id(meter_id))
}

pub fn cost_series_name(meter_id: &str) -> String {
    format!("{SERIES_NAME_PREFIX} {} Cost", normalize_id(meter_id))
}
