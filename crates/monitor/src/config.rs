//! Startup configuration: required settings from the environment (with
//! `.env` support provided by the caller) plus an optional TOML file of
//! alert thresholds and timings.  Anything missing or out of range is a
//! fatal startup error; every violation is reported at once.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Config structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub plug: PlugConfig,
    pub pushbullet_api_key: String,
    pub latitude: f64,
    pub longitude: f64,
    pub log_dir: PathBuf,
    /// `0` disables the status server.
    pub web_port: u16,
    pub tuning: Tuning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugKind {
    /// TP-Link Kasa plug, local TCP protocol.
    Kasa,
    /// Tasmota-flashed plug reached through an MQTT broker.
    Tasmota,
    /// In-process pump model, no hardware.
    Sim,
}

#[derive(Debug, Clone)]
pub struct PlugConfig {
    pub kind: PlugKind,
    /// Kasa: `host` or `host:port`.  Tasmota: the device topic.
    pub addr: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Tuning {
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub timing: Timing,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub power_threshold_w: f64,
    pub long_run_sec: u64,
    pub no_power_sec: u64,
    pub rain_alert_mm: f64,
    pub lawn_alert_mm: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            power_threshold_w: 0.005,
            long_run_sec: 60,
            no_power_sec: 6 * 60 * 60,
            rain_alert_mm: 10.0,
            // 1.5 inches
            lawn_alert_mm: 38.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub tick_sec: u64,
    pub hourly_refresh_sec: u64,
    pub daily_refresh_sec: u64,
    pub power_timeout_sec: u64,
    pub weather_timeout_sec: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick_sec: 1,
            hourly_refresh_sec: 3600,
            daily_refresh_sec: 86_400,
            power_timeout_sec: 5,
            weather_timeout_sec: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load configuration from the process environment.
///
/// Required: `PUSHBULLET_API_KEY`, `LATITUDE`, `LONGITUDE`, and `PLUG_ADDR`
/// (except for `PLUG_KIND=sim`).
///
/// Optional: `PLUG_KIND` (kasa), `MQTT_HOST` (127.0.0.1), `MQTT_PORT` (1883),
/// `LOG_DIR` (logs), `WEB_PORT` (8080), `CONFIG_PATH` (no tuning file).
pub fn load_from_env() -> Result<Config> {
    from_vars(|name| std::env::var(name).ok())
}

/// Same as [`load_from_env`] but reads variables through `var`.
pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let tuning = match var("CONFIG_PATH") {
        Some(path) => load_tuning(&path)?,
        None => Tuning::default(),
    };

    let mut errors: Vec<String> = Vec::new();

    let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());

    let kind = match non_empty("PLUG_KIND").as_deref().map(str::to_ascii_lowercase) {
        None => PlugKind::Kasa,
        Some(k) if k == "kasa" => PlugKind::Kasa,
        Some(k) if k == "tasmota" => PlugKind::Tasmota,
        Some(k) if k == "sim" => PlugKind::Sim,
        Some(other) => {
            errors.push(format!(
                "PLUG_KIND '{other}' is not one of kasa, tasmota, sim"
            ));
            PlugKind::Kasa
        }
    };

    let addr = match non_empty("PLUG_ADDR") {
        Some(a) => a.trim().to_string(),
        None if kind == PlugKind::Sim => "sim".to_string(),
        None => {
            errors.push("PLUG_ADDR must be set".to_string());
            String::new()
        }
    };

    let pushbullet_api_key = non_empty("PUSHBULLET_API_KEY").unwrap_or_else(|| {
        errors.push("PUSHBULLET_API_KEY must be set".to_string());
        String::new()
    });

    let latitude = parse_required::<f64>(&var, "LATITUDE", &mut errors);
    if let Some(lat) = latitude {
        if !(-90.0..=90.0).contains(&lat) {
            errors.push(format!("LATITUDE {lat} out of range [-90, 90]"));
        }
    }
    let longitude = parse_required::<f64>(&var, "LONGITUDE", &mut errors);
    if let Some(lon) = longitude {
        if !(-180.0..=180.0).contains(&lon) {
            errors.push(format!("LONGITUDE {lon} out of range [-180, 180]"));
        }
    }

    let mqtt_host = non_empty("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
    let mqtt_port = parse_optional(&var, "MQTT_PORT", 1883u16, &mut errors);
    let web_port = parse_optional(&var, "WEB_PORT", 8080u16, &mut errors);
    let log_dir = PathBuf::from(non_empty("LOG_DIR").unwrap_or_else(|| "logs".to_string()));

    tuning.validate_into(&mut errors);

    if !errors.is_empty() {
        bail!(
            "config validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
    }

    Ok(Config {
        plug: PlugConfig {
            kind,
            addr,
            mqtt_host,
            mqtt_port,
        },
        pushbullet_api_key,
        latitude: latitude.unwrap_or_default(),
        longitude: longitude.unwrap_or_default(),
        log_dir,
        web_port,
        tuning,
    })
}

fn parse_required<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    errors: &mut Vec<String>,
) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match var(name).filter(|v| !v.trim().is_empty()) {
        None => {
            errors.push(format!("{name} must be set"));
            None
        }
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => Some(v),
            Err(e) => {
                errors.push(format!("{name} '{raw}' is invalid: {e}"));
                None
            }
        },
    }
}

fn parse_optional<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    errors: &mut Vec<String>,
) -> T
where
    T::Err: std::fmt::Display,
{
    match var(name).filter(|v| !v.trim().is_empty()) {
        None => default,
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|e| {
            errors.push(format!("{name} '{raw}' is invalid: {e}"));
            default
        }),
    }
}

/// Read and parse a TOML tuning file.  Range checks happen in
/// [`Tuning::validate`].
pub fn load_tuning(path: &str) -> Result<Tuning> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Upper bound for every duration setting: 366 days.
pub const MAX_DURATION_SEC: u64 = 366 * 86_400;

impl Tuning {
    #[cfg(test)]
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        self.validate_into(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            bail!("invalid tuning:\n  - {}", errors.join("\n  - "));
        }
    }

    fn validate_into(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;
        if !(t.power_threshold_w.is_finite() && t.power_threshold_w > 0.0) {
            errors.push(format!(
                "thresholds.power_threshold_w must be positive, got {}",
                t.power_threshold_w
            ));
        }
        if !(t.rain_alert_mm.is_finite() && t.rain_alert_mm > 0.0) {
            errors.push(format!(
                "thresholds.rain_alert_mm must be positive, got {}",
                t.rain_alert_mm
            ));
        }
        if !(t.lawn_alert_mm.is_finite() && t.lawn_alert_mm > 0.0) {
            errors.push(format!(
                "thresholds.lawn_alert_mm must be positive, got {}",
                t.lawn_alert_mm
            ));
        }

        let positive = [
            ("thresholds.long_run_sec", t.long_run_sec),
            ("thresholds.no_power_sec", t.no_power_sec),
            ("timing.tick_sec", self.timing.tick_sec),
            ("timing.hourly_refresh_sec", self.timing.hourly_refresh_sec),
            ("timing.daily_refresh_sec", self.timing.daily_refresh_sec),
            ("timing.power_timeout_sec", self.timing.power_timeout_sec),
            ("timing.weather_timeout_sec", self.timing.weather_timeout_sec),
        ];
        for (name, value) in positive {
            if value == 0 {
                errors.push(format!("{name} must be positive"));
            } else if value > MAX_DURATION_SEC {
                errors.push(format!(
                    "{name} ({value}) exceeds the maximum of {MAX_DURATION_SEC}"
                ));
            }
        }

        if self.timing.power_timeout_sec > 0
            && self.timing.power_timeout_sec >= t.long_run_sec
        {
            errors.push(format!(
                "timing.power_timeout_sec ({}) must be less than thresholds.long_run_sec ({})",
                self.timing.power_timeout_sec, t.long_run_sec
            ));
        }
    }
}

impl Config {
    /// Log the effective configuration with the push credential masked.
    pub fn log_config(&self) {
        let key = &self.pushbullet_api_key;
        let masked_key = if key.chars().count() > 4 {
            format!("{}****", key.chars().take(4).collect::<String>())
        } else {
            "****".to_string()
        };
        let t = &self.tuning.thresholds;
        let tm = &self.tuning.timing;

        tracing::info!(
            plug_kind = ?self.plug.kind,
            plug_addr = %self.plug.addr,
            latitude = self.latitude,
            longitude = self.longitude,
            log_dir = %self.log_dir.display(),
            web_port = self.web_port,
            pushbullet_api_key = %masked_key,
            "configuration loaded"
        );
        tracing::info!(
            power_threshold_w = t.power_threshold_w,
            long_run_sec = t.long_run_sec,
            no_power_sec = t.no_power_sec,
            rain_alert_mm = t.rain_alert_mm,
            lawn_alert_mm = t.lawn_alert_mm,
            tick_sec = tm.tick_sec,
            hourly_refresh_sec = tm.hourly_refresh_sec,
            daily_refresh_sec = tm.daily_refresh_sec,
            "thresholds loaded"
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================
