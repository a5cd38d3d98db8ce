use time::OffsetDateTime;

/// Canonical volume unit a meter's readings are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Unit {
    Gallons,
    CubicFeet,
    CubicMeters,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Gallons => "gal",
            Unit::CubicFeet => "ft³",
            Unit::CubicMeters => "m³",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("unsupported measurement unit: {0}")]
    Unsupported(String),
}

/// Convert a vendor-native amount into the canonical unit of the account's
/// measurement system.
///
/// Imperial accounts are normalized to gallons; metric accounts only accept
/// cubic meters. Unit names are matched case-insensitively.
pub fn convert_native(
    native_unit: &str,
    amount: f64,
    metric: bool,
) -> Result<(f64, Unit), UnitError> {
    let upper = native_unit.trim().to_ascii_uppercase();

    if metric {
        return match upper.as_str() {
            "CM" | "CUBIC_METER" => Ok((amount, Unit::CubicMeters)),
            _ => Err(UnitError::Unsupported(upper)),
        };
    }

    let factor = match upper.as_str() {
        "GAL" => 1.0,
        "10 GAL" => 10.0,
        "100 GAL" => 100.0,
        "KGAL" => 1000.0,
        "CF" | "CUBIC_FEET" => 7.48052,
        "CCF" => 748.052,
        _ => return Err(UnitError::Unsupported(upper)),
    };

    Ok((amount * factor, Unit::Gallons))
}

/// One absolute meter reading as fetched from the metering source.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reading {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    pub value: f64,
    pub unit: Unit,
}

impl Reading {
    pub fn new(ts: OffsetDateTime, value: f64, unit: Unit) -> Self {
        Self { ts, value, unit }
    }
}
