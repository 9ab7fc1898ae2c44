//! Append-only CSV time-series logs: power samples, weather snapshots and
//! the alert record.  Each file has exactly one writer; rows are appended by
//! reopening the file, so external rotation or tailing is safe.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::model::{Alert, PowerSample, WeatherSnapshot};

pub const POWER_FILE: &str = "power_data.csv";
pub const WEATHER_FILE: &str = "rain_log.csv";
pub const ALERT_FILE: &str = "alerts.csv";

pub const POWER_HEADER: &str = "timestamp,power_watts";
pub const WEATHER_HEADER: &str = "timestamp,rainfall_mm,soil_moisture_0_to_1cm,\
soil_moisture_1_to_3cm,soil_moisture_3_to_9cm,soil_moisture_9_to_27cm,soil_moisture_27_to_81cm";
pub const ALERT_HEADER: &str = "timestamp,kind,message";

/// Timestamp layout: ISO-8601 local wall-clock time without offset, with
/// microseconds.
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

// ---------------------------------------------------------------------------
// Generic CSV file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CsvLog {
    path: PathBuf,
    header: &'static str,
}

impl CsvLog {
    pub fn new(path: impl Into<PathBuf>, header: &'static str) -> Self {
        Self {
            path: path.into(),
            header,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the header if the file is missing or empty.
    pub fn ensure_header(&self) -> Result<()> {
        let empty = match fs::metadata(&self.path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat {}", self.path.display()))
            }
        };
        if empty {
            self.write_line(self.header)?;
        }
        Ok(())
    }

    /// Append one pre-formatted row, initialising the header first if needed.
    pub fn append(&self, row: &str) -> Result<()> {
        self.ensure_header()?;
        self.write_line(row)
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))
    }
}

// ---------------------------------------------------------------------------
// Typed logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PowerLog(CsvLog);

impl PowerLog {
    /// Opens the power log, creating it with its header straight away.
    pub fn open(dir: &Path) -> Result<Self> {
        let log = CsvLog::new(dir.join(POWER_FILE), POWER_HEADER);
        log.ensure_header()?;
        Ok(Self(log))
    }

    pub fn append(&self, sample: &PowerSample) -> Result<()> {
        self.0.append(&power_row(sample))
    }
}

/// The weather log is created lazily: its header lands with the first
/// successful snapshot.
#[derive(Debug, Clone)]
pub struct WeatherLog(CsvLog);

impl WeatherLog {
    pub fn open(dir: &Path) -> Self {
        Self(CsvLog::new(dir.join(WEATHER_FILE), WEATHER_HEADER))
    }

    pub fn append(&self, snapshot: &WeatherSnapshot) -> Result<()> {
        self.0.append(&weather_row(snapshot))
    }

    pub fn path(&self) -> &Path {
        self.0.path()
    }
}

#[derive(Debug, Clone)]
pub struct AlertLog(CsvLog);

impl AlertLog {
    pub fn open(dir: &Path) -> Self {
        Self(CsvLog::new(dir.join(ALERT_FILE), ALERT_HEADER))
    }

    pub fn append(&self, alert: &Alert) -> Result<()> {
        self.0.append(&alert_row(alert))
    }
}

// ---------------------------------------------------------------------------
// Row formatting
// ---------------------------------------------------------------------------

pub fn format_ts(ts: &DateTime<Local>) -> String {
    ts.naive_local().format(TS_FORMAT).to_string()
}

pub fn power_row(sample: &PowerSample) -> String {
    format!("{},{}", format_ts(&sample.ts), sample.watts)
}

pub fn weather_row(snapshot: &WeatherSnapshot) -> String {
    let mut row = format!("{},{:.2}", format_ts(&snapshot.ts), snapshot.rainfall_mm);
    for m in snapshot.soil_moisture {
        row.push_str(&format!(",{m:.3}"));
    }
    row
}

pub fn alert_row(alert: &Alert) -> String {
    format!(
        "{},{},{}",
        format_ts(&alert.ts),
        alert.kind.as_str(),
        quote_field(&alert.message)
    )
}

/// RFC 4180 quoting, only when the field needs it.
fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
