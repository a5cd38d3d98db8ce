use std::{
    collections::BTreeSet,
    fs::File,
    path::{Path, PathBuf},
};

use csv::StringRecord;
use statistics_client::domain::{convert_native, Reading};
use time::{Duration, OffsetDateTime};

use super::{FetchError, MeterSource};

/// Readings exported to a CSV file, used by the backfill binary.
///
/// Expected header columns (by name):
/// - ts (RFC3339 timestamp)
/// - meter_id
/// - reading (absolute meter value in the native unit)
/// - unit (optional, native unit name; defaults to `GAL`, or `CM` for metric accounts)
pub struct CsvReadingSource {
    path: PathBuf,
    metric: bool,
}

struct CsvRow {
    meter_id: String,
    reading: Reading,
}

impl CsvReadingSource {
    pub fn new<P: Into<PathBuf>>(path: P, metric: bool) -> Self {
        Self {
            path: path.into(),
            metric,
        }
    }

    /// Distinct meter ids present in the file, sorted.
    pub async fn meter_ids(&self) -> Result<Vec<String>, FetchError> {
        let rows = self.load().await?;
        let ids: BTreeSet<String> = rows.into_iter().map(|r| r.meter_id).collect();
        Ok(ids.into_iter().collect())
    }

    async fn load(&self) -> Result<Vec<CsvRow>, FetchError> {
        let path = self.path.clone();
        let metric = self.metric;
        tokio::task::spawn_blocking(move || read_file(&path, metric))
            .await
            .map_err(|e| FetchError::Transient(format!("CSV reader task failed: {e}")))?
    }

    async fn readings_for(&self, meter_id: &str) -> Result<Vec<Reading>, FetchError> {
        let mut readings: Vec<Reading> = self
            .load()
            .await?
            .into_iter()
            .filter(|r| r.meter_id == meter_id)
            .map(|r| r.reading)
            .collect();
        readings.sort_by_key(|r| r.ts);
        Ok(readings)
    }
}

fn read_file(path: &Path, metric: bool) -> Result<Vec<CsvRow>, FetchError> {
    let file = File::open(path)
        .map_err(|e| FetchError::Transient(format!("failed to open CSV file: {e}")))?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr
        .headers()
        .map_err(|e| FetchError::Transient(format!("failed to read CSV headers: {e}")))?
        .clone();

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result
            .map_err(|e| FetchError::Transient(format!("failed to read CSV record: {e}")))?;
        match record_to_row(&record, &headers, metric) {
            Ok(row) => rows.push(row),
            Err(e) => {
                metrics::counter!("statistics_csv_parse_errors_total").increment(1);
                return Err(e);
            }
        }
    }
    Ok(rows)
}

fn record_to_row(
    record: &StringRecord,
    headers: &StringRecord,
    metric: bool,
) -> Result<CsvRow, FetchError> {
    let get = |name: &str| -> Result<&str, FetchError> {
        headers
            .iter()
            .position(|h| h == name)
            .and_then(|idx| record.get(idx))
            .ok_or_else(|| FetchError::Transient(format!("missing column '{name}' in CSV record")))
    };

    let ts_str = get("ts")?;
    let ts = OffsetDateTime::parse(ts_str.trim(), &time::format_description::well_known::Rfc3339)
        .map_err(|e| FetchError::Transient(format!("invalid ts '{ts_str}': {e}")))?;

    let meter_id = get("meter_id")?.trim().to_string();

    let reading_str = get("reading")?;
    let amount: f64 = reading_str
        .trim()
        .parse()
        .map_err(|e| FetchError::Transient(format!("invalid reading '{reading_str}': {e}")))?;

    let default_unit = if metric { "CM" } else { "GAL" };
    let unit = get("unit")
        .map(str::trim)
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or(default_unit);
    let (value, unit) = convert_native(unit, amount, metric)
        .map_err(|e| FetchError::Transient(e.to_string()))?;

    Ok(CsvRow {
        meter_id,
        reading: Reading::new(ts, value, unit),
    })
}

#[async_trait::async_trait]
impl MeterSource for CsvReadingSource {
    async fn fetch_readings(
        &self,
        meter_id: &str,
        lookback_days: u32,
    ) -> Result<Vec<Reading>, FetchError> {
        let readings = self.readings_for(meter_id).await?;
        let cutoff =
            OffsetDateTime::now_utc().checked_sub(Duration::days(i64::from(lookback_days)));
        Ok(match cutoff {
            Some(cutoff) => readings.into_iter().filter(|r| r.ts >= cutoff).collect(),
            None => readings,
        })
    }

    async fn fetch_live_snapshot(&self, meter_id: &str) -> Result<Reading, FetchError> {
        self.readings_for(meter_id)
            .await?
            .pop()
            .ok_or_else(|| {
                FetchError::Transient(format!("no readings for meter '{meter_id}' in CSV file"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statistics_client::domain::Unit;
    use std::io::Write;

    fn write_csv(name: &str, contents: &str) -> PathBuf {
        let file_name = format!("statistics-csv-{}-{name}.csv", std::process::id());
        let path = std::env::temp_dir().join(file_name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn reads_rows_for_one_meter_in_time_order() {
        let path = write_csv(
            "order",
            "ts,meter_id,reading,unit\n\
             2026-01-01T02:00:00Z,m-1,12,GAL\n\
             2026-01-01T00:00:00Z,m-1,10,GAL\n\
             2026-01-01T01:00:00Z,m-2,1,KGAL\n\
             2026-01-01T01:00:00Z,m-1,11,\n",
        );
        let source = CsvReadingSource::new(path.clone(), false);

        let readings = source.fetch_readings("m-1", u32::MAX).await.unwrap();
        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![10.0, 11.0, 12.0]);
        assert!(readings.iter().all(|r| r.unit == Unit::Gallons));

        assert_eq!(source.meter_ids().await.unwrap(), vec!["m-1".to_string(), "m-2".to_string()]);
        assert_eq!(source.fetch_live_snapshot("m-2").await.unwrap().value, 1000.0);

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn invalid_reading_fails_the_load() {
        let path = write_csv("invalid", "ts,meter_id,reading\n2026-01-01T00:00:00Z,m-1,abc\n");
        let source = CsvReadingSource::new(path.clone(), false);

        let res = source.fetch_readings("m-1", 3).await;
        assert!(matches!(res, Err(FetchError::Transient(_))));

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn lookback_drops_old_rows() {
        let path = write_csv("lookback", "ts,meter_id,reading\n2001-01-01T00:00:00Z,m-1,5\n");
        let source = CsvReadingSource::new(path.clone(), false);

        assert!(source.fetch_readings("m-1", 3).await.unwrap().is_empty());
        assert_eq!(source.fetch_readings("m-1", u32::MAX).await.unwrap().len(), 1);

        std::fs::remove_file(path).ok();
    }
}
