//! Test doubles for the leaf capabilities: alert sink, weather source and
//! power source.

use anyhow::{anyhow, bail, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::alert::AlertSink;
use crate::model::{Alert, AlertKind};
use crate::plug::PowerSource;
use crate::weather::{DayWeather, WeatherSource};

// ---------------------------------------------------------------------------
// Alert sink
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<Alert>>>,
    fail: bool,
}

impl RecordingSink {
    /// A sink that records every alert and then reports a delivery failure.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn kinds(&self) -> Vec<AlertKind> {
        self.sent.lock().unwrap().iter().map(|a| a.kind).collect()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.sent.lock().unwrap().clone()
    }
}

impl AlertSink for RecordingSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        self.sent.lock().unwrap().push(alert.clone());
        if self.fail {
            bail!("push service unreachable");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Weather source
// ---------------------------------------------------------------------------

/// Returns fixed answers; `None` makes the corresponding fetch fail.
#[derive(Clone, Default)]
pub struct FakeWeather {
    pub day: Arc<Mutex<Option<DayWeather>>>,
    pub week: Arc<Mutex<Option<f64>>>,
    pub day_calls: Arc<AtomicUsize>,
    pub week_calls: Arc<AtomicUsize>,
}

impl FakeWeather {
    pub fn new(day: Option<DayWeather>, week: Option<f64>) -> Self {
        Self {
            day: Arc::new(Mutex::new(day)),
            week: Arc::new(Mutex::new(week)),
            ..Self::default()
        }
    }

    pub fn set_day(&self, day: Option<DayWeather>) {
        *self.day.lock().unwrap() = day;
    }

    pub fn day_calls(&self) -> usize {
        self.day_calls.load(Ordering::SeqCst)
    }

    pub fn week_calls(&self) -> usize {
        self.week_calls.load(Ordering::SeqCst)
    }
}

impl WeatherSource for FakeWeather {
    async fn fetch_day(&self) -> Result<DayWeather> {
        self.day_calls.fetch_add(1, Ordering::SeqCst);
        let day = *self.day.lock().unwrap();
        day.ok_or_else(|| anyhow!("weather api timed out"))
    }

    async fn fetch_week_rain(&self) -> Result<f64> {
        self.week_calls.fetch_add(1, Ordering::SeqCst);
        let week = *self.week.lock().unwrap();
        week.ok_or_else(|| anyhow!("weather api timed out"))
    }
}

/// A weather service that accepts requests and never answers.
#[derive(Clone, Default)]
pub struct StalledWeather {
    calls: Arc<AtomicUsize>,
}

impl StalledWeather {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl WeatherSource for StalledWeather {
    async fn fetch_day(&self) -> Result<DayWeather> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<Result<DayWeather>>().await
    }

    async fn fetch_week_rain(&self) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<Result<f64>>().await
    }
}

// ---------------------------------------------------------------------------
// Power source
// ---------------------------------------------------------------------------

/// One scripted answer to `read_watts`.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Watts(f64),
    Fail,
    /// Never answers; only a timeout gets the caller out.
    Hang,
}

#[derive(Clone, Default)]
pub struct ScriptedPlug {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    /// Answer once the script runs out.
    pub fallback: f64,
    pub fail_turn_off: bool,
    turn_offs: Arc<AtomicUsize>,
}

impl ScriptedPlug {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().collect())),
            ..Self::default()
        }
    }

    pub fn turn_offs(&self) -> usize {
        self.turn_offs.load(Ordering::SeqCst)
    }
}

impl PowerSource for ScriptedPlug {
    async fn read_watts(&mut self) -> Result<f64> {
        let next = self.replies.lock().unwrap().pop_front();
        match next.unwrap_or(Reply::Watts(self.fallback)) {
            Reply::Watts(w) => Ok(w),
            Reply::Fail => bail!("plug unreachable"),
            Reply::Hang => std::future::pending::<Result<f64>>().await,
        }
    }

    async fn turn_off(&mut self) -> Result<()> {
        self.turn_offs.fetch_add(1, Ordering::SeqCst);
        if self.fail_turn_off {
            bail!("relay command rejected");
        }
        Ok(())
    }
}
