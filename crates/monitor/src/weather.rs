//! Weather source: trailing-24h rainfall and soil moisture, plus the 7-day
//! rainfall total, from the Open-Meteo forecast API.  Any missing or `null`
//! value in a response fails the whole fetch.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

use crate::model::{SoilMoisture, SOIL_BANDS};

pub const OPEN_METEO_URL: &str = "https://api.open-meteo.com/v1/forecast";

/// Hourly rain values summed for the trailing-day figure.
const HOURS_PER_DAY: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayWeather {
    pub rainfall_mm: f64,
    pub soil_moisture: SoilMoisture,
}

pub trait WeatherSource {
    /// Rainfall over the trailing 24 hours and the latest soil moisture.
    fn fetch_day(&self) -> impl Future<Output = Result<DayWeather>> + Send;

    /// Precipitation summed over the trailing seven days.
    fn fetch_week_rain(&self) -> impl Future<Output = Result<f64>> + Send;
}

// ---------------------------------------------------------------------------
// Open-Meteo client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OpenMeteo {
    client: reqwest::Client,
    base_url: String,
    latitude: f64,
    longitude: f64,
}

impl OpenMeteo {
    pub fn new(latitude: f64, longitude: f64, timeout: Duration) -> Result<Self> {
        Self::with_base_url(OPEN_METEO_URL, latitude, longitude, timeout)
    }

    pub fn with_base_url(
        base_url: &str,
        latitude: f64,
        longitude: f64,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build weather http client")?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            latitude,
            longitude,
        })
    }

    async fn get(&self, params: &[(&str, String)]) -> Result<String> {
        let mut query = vec![
            ("latitude", self.latitude.to_string()),
            ("longitude", self.longitude.to_string()),
            ("timezone", "auto".to_string()),
        ];
        query.extend(params.iter().cloned());

        let body = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .context("weather request failed")?
            .error_for_status()
            .context("weather api returned an error status")?
            .text()
            .await
            .context("failed to read weather response")?;
        Ok(body)
    }
}

impl WeatherSource for OpenMeteo {
    async fn fetch_day(&self) -> Result<DayWeather> {
        let hourly = std::iter::once("rain".to_string())
            .chain(SOIL_BANDS.iter().map(|b| format!("soil_moisture_{b}")))
            .collect::<Vec<_>>()
            .join(",");
        let body = self
            .get(&[
                ("hourly", hourly),
                ("past_hours", HOURS_PER_DAY.to_string()),
                ("forecast_hours", "1".to_string()),
            ])
            .await?;
        parse_day(&body)
    }

    async fn fetch_week_rain(&self) -> Result<f64> {
        let body = self
            .get(&[
                ("daily", "precipitation_sum".to_string()),
                ("past_days", "7".to_string()),
                ("forecast_days", "1".to_string()),
            ])
            .await?;
        parse_week(&body)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HourlyResponse {
    hourly: Hourly,
}

#[derive(Debug, Deserialize)]
struct Hourly {
    rain: Vec<Option<f64>>,
    soil_moisture_0_to_1cm: Vec<Option<f64>>,
    soil_moisture_1_to_3cm: Vec<Option<f64>>,
    soil_moisture_3_to_9cm: Vec<Option<f64>>,
    soil_moisture_9_to_27cm: Vec<Option<f64>>,
    soil_moisture_27_to_81cm: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct DailyResponse {
    daily: Daily,
}

#[derive(Debug, Deserialize)]
struct Daily {
    precipitation_sum: Vec<Option<f64>>,
}

pub fn parse_day(body: &str) -> Result<DayWeather> {
    let resp: HourlyResponse =
        serde_json::from_str(body).context("malformed hourly weather response")?;
    let h = resp.hourly;

    if h.rain.len() < HOURS_PER_DAY {
        bail!(
            "hourly rain has {} values, need {HOURS_PER_DAY}",
            h.rain.len()
        );
    }
    let rainfall_mm = sum_all(&h.rain[h.rain.len() - HOURS_PER_DAY..], "rain")?;

    let bands = [
        &h.soil_moisture_0_to_1cm,
        &h.soil_moisture_1_to_3cm,
        &h.soil_moisture_3_to_9cm,
        &h.soil_moisture_9_to_27cm,
        &h.soil_moisture_27_to_81cm,
    ];
    let mut soil_moisture = [0.0; 5];
    for (i, values) in bands.iter().enumerate() {
        soil_moisture[i] = match values.last() {
            Some(Some(v)) => *v,
            Some(None) => bail!("latest soil_moisture_{} is null", SOIL_BANDS[i]),
            None => bail!("soil_moisture_{} is empty", SOIL_BANDS[i]),
        };
    }

    Ok(DayWeather {
        rainfall_mm,
        soil_moisture,
    })
}

pub fn parse_week(body: &str) -> Result<f64> {
    let resp: DailyResponse =
        serde_json::from_str(body).context("malformed daily weather response")?;
    if resp.daily.precipitation_sum.is_empty() {
        bail!("precipitation_sum is empty");
    }
    sum_all(&resp.daily.precipitation_sum, "precipitation_sum")
}

fn sum_all(values: &[Option<f64>], field: &str) -> Result<f64> {
    values.iter().enumerate().try_fold(0.0, |acc, (i, v)| match v {
        Some(v) => Ok(acc + v),
        None => bail!("{field}[{i}] is null"),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
