use chrono::{DateTime, Local};
use serde::Serialize;

/// Soil-moisture depth bands reported by the weather source, shallowest
/// first.  The names double as Open-Meteo variable suffixes and CSV column
/// suffixes.
pub const SOIL_BANDS: [&str; 5] = [
    "0_to_1cm",
    "1_to_3cm",
    "3_to_9cm",
    "9_to_27cm",
    "27_to_81cm",
];

// ---------------------------------------------------------------------------
// Samples & snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerSample {
    pub ts: DateTime<Local>,
    pub watts: f64,
}

/// Volumetric soil moisture (m³/m³) per band, indexed like [`SOIL_BANDS`].
pub type SoilMoisture = [f64; 5];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    pub ts: DateTime<Local>,
    pub rainfall_mm: f64,
    pub soil_moisture: SoilMoisture,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PowerDetected,
    LongRun,
    NoPowerWithRain,
    LawnWatering,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PowerDetected => "power_detected",
            Self::LongRun => "long_run",
            Self::NoPowerWithRain => "no_power_with_rain",
            Self::LawnWatering => "lawn_watering",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub ts: DateTime<Local>,
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn power_detected(ts: DateTime<Local>, watts: f64) -> Self {
        Self {
            ts,
            kind: AlertKind::PowerDetected,
            message: format!("Power draw detected: {watts:.2}W"),
        }
    }

    pub fn long_run(ts: DateTime<Local>, limit_sec: u64) -> Self {
        Self {
            ts,
            kind: AlertKind::LongRun,
            message: format!(
                "Power draw over {} — turning plug OFF.",
                describe_secs(limit_sec)
            ),
        }
    }

    pub fn no_power_with_rain(ts: DateTime<Local>, limit_sec: u64, rain_mm: f64) -> Self {
        Self {
            ts,
            kind: AlertKind::NoPowerWithRain,
            message: format!(
                "No power draw in {} AND {rain_mm:.1} mm rain in 24h.",
                describe_secs(limit_sec)
            ),
        }
    }

    pub fn lawn_watering(ts: DateTime<Local>, rain_7d_mm: f64) -> Self {
        Self {
            ts,
            kind: AlertKind::LawnWatering,
            message: format!("Lawn watering alert: only {rain_7d_mm:.1} mm rain in past 7 days."),
        }
    }
}

/// Render a whole-second duration the way an operator would say it:
/// "45 seconds", "1 minute", "6h".
pub fn describe_secs(secs: u64) -> String {
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        let m = secs / 60;
        format!("{m} minute{}", if m == 1 { "" } else { "s" })
    } else {
        format!("{secs} second{}", if secs == 1 { "" } else { "s" })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
