use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::model::{Alert, AlertKind, PowerSample, WeatherSnapshot};
use crate::monitor::Episode;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Read-mostly view of the monitor for the status endpoint.  The monitoring
/// loop and the weather worker publish into it at tick boundaries; nothing
/// reads decisions back out of it.
pub type SharedState = Arc<RwLock<StatusBoard>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct StatusBoard {
    pub started_at: Instant,
    pub pump: Episode,
    pub last_sample: Option<PowerSample>,
    pub last_power_time: Option<DateTime<Local>>,
    pub weather: Option<WeatherSnapshot>,
    pub week_rain_mm: Option<f64>,
    pub last_hourly_check: Option<DateTime<Local>>,
    pub last_daily_check: Option<DateTime<Local>>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Local>,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertKind>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub pump: Episode,
    pub last_sample: Option<PowerSample>,
    pub last_power_time: Option<DateTime<Local>>,
    pub rain_24h_mm: f64,
    pub weather: Option<WeatherSnapshot>,
    pub week_rain_mm: Option<f64>,
    pub last_hourly_check: Option<DateTime<Local>>,
    pub last_daily_check: Option<DateTime<Local>>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            pump: Episode::Idle {
                no_power_alerted: false,
            },
            last_sample: None,
            last_power_time: None,
            weather: None,
            week_rain_mm: None,
            last_hourly_check: None,
            last_daily_check: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record the outcome of one power tick.
    pub fn record_power(
        &mut self,
        sample: PowerSample,
        pump: Episode,
        last_power_time: DateTime<Local>,
    ) {
        self.last_sample = Some(sample);
        self.pump = pump;
        self.last_power_time = Some(last_power_time);
    }

    pub fn record_weather(&mut self, snapshot: WeatherSnapshot) {
        self.weather = Some(snapshot);
    }

    pub fn record_week_rain(&mut self, rain_mm: f64) {
        self.week_rain_mm = Some(rain_mm);
    }

    pub fn record_alert(&mut self, alert: &Alert) {
        self.push_event(EventKind::Alert, Some(alert.kind), alert.message.clone());
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, None, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, None, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            pump: self.pump,
            last_sample: self.last_sample,
            last_power_time: self.last_power_time,
            rain_24h_mm: self.weather.map(|w| w.rainfall_mm).unwrap_or(0.0),
            weather: self.weather,
            week_rain_mm: self.week_rain_mm,
            last_hourly_check: self.last_hourly_check,
            last_daily_check: self.last_daily_check,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, alert: Option<AlertKind>, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Local::now(),
            kind,
            alert,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
