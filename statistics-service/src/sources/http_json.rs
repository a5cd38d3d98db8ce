use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use statistics_client::domain::{convert_native, Reading};
use time::OffsetDateTime;

use super::{FetchError, MeterSource};

/// Metering API client.
///
/// Endpoints, relative to `base_url`:
/// - `GET meters/{meter_id}/readings?days={lookback_days}` → `{"readings": [...]}`
/// - `GET meters/{meter_id}/latest` → one reading object
///
/// Each reading object is `{"ts": RFC3339, "value": number, "unit": native unit}`.
pub struct HttpMeterSource {
    http: reqwest::Client,
    base_url: Url,
    auth_bearer_token: Option<String>,
    metric: bool,
}

#[derive(serde::Deserialize)]
struct IncomingReading {
    #[serde(with = "time::serde::rfc3339")]
    ts: OffsetDateTime,
    value: f64,
    unit: String,
}

#[derive(serde::Deserialize)]
struct IncomingReadings {
    #[serde(default)]
    readings: Vec<IncomingReading>,
}

impl IncomingReading {
    fn into_reading(self, metric: bool) -> Result<Reading, FetchError> {
        let (value, unit) = convert_native(&self.unit, self.value, metric)
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        Ok(Reading::new(self.ts, value, unit))
    }
}

impl HttpMeterSource {
    pub fn new(
        base_url: &str,
        auth_bearer_token: Option<String>,
        timeout: Duration,
        metric: bool,
    ) -> Result<Self, FetchError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            FetchError::Transient(format!("invalid metering base url '{base_url}': {e}"))
        })?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transient(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            auth_bearer_token,
            metric,
        })
    }

    fn meter_url(&self, meter_id: &str, leaf: &str) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                let base = &self.base_url;
                FetchError::Transient(format!("metering base url '{base}' cannot carry a path"))
            })?
            .pop_if_empty()
            .extend(["meters", meter_id, leaf]);
        Ok(url)
    }

    async fn get_body(&self, url: Url, query: &[(&str, String)]) -> Result<String, FetchError> {
        let mut req = self.http.get(url.clone()).query(query);
        if let Some(token) = &self.auth_bearer_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("request to {url} failed: {e}")))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::Auth(format!("{url} answered {}", status.as_u16())));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("reading body from {url} failed: {e}")))?;

        if !status.is_success() {
            return Err(FetchError::Transient(format!("{url} answered {}", status.as_u16())));
        }

        Ok(body)
    }
}

/// Decode a JSON body; an empty or truncated body is reported as
/// [`FetchError::EmptyBody`] so callers can retry with a shorter window.
fn decode<T: DeserializeOwned>(body: &str, url: &Url) -> Result<T, FetchError> {
    if body.trim().is_empty() {
        return Err(FetchError::EmptyBody(url.to_string()));
    }
    serde_json::from_str(body).map_err(|e| {
        if e.is_eof() {
            FetchError::EmptyBody(format!("{url}: {e}"))
        } else {
            FetchError::Transient(format!("invalid json from {url}: {e}"))
        }
    })
}

fn to_readings(incoming: IncomingReadings, metric: bool) -> Result<Vec<Reading>, FetchError> {
    let mut readings = incoming
        .readings
        .into_iter()
        .map(|r| r.into_reading(metric))
        .collect::<Result<Vec<_>, _>>()?;
    readings.sort_by_key(|r| r.ts);
    Ok(readings)
}

#[async_trait::async_trait]
impl MeterSource for HttpMeterSource {
    async fn fetch_readings(
        &self,
        meter_id: &str,
        lookback_days: u32,
    ) -> Result<Vec<Reading>, FetchError> {
        let url = self.meter_url(meter_id, "readings")?;
        let body = self
            .get_body(url.clone(), &[("days", lookback_days.to_string())])
            .await?;
        let readings = to_readings(decode(&body, &url)?, self.metric)?;
        tracing::debug!(
            meter_id,
            lookback_days,
            count = readings.len(),
            unit = readings.first().map(|r| r.unit.symbol()),
            "fetched meter readings"
        );
        Ok(readings)
    }

    async fn fetch_live_snapshot(&self, meter_id: &str) -> Result<Reading, FetchError> {
        let url = self.meter_url(meter_id, "latest")?;
        let body = self.get_body(url.clone(), &[]).await?;
        decode::<IncomingReading>(&body, &url)?.into_reading(self.metric)
    }
}
