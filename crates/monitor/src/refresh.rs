//! Weather refresh worker: keeps the 24h rain cache warm and runs the weekly
//! lawn-watering check, independently of the power loop.
//!
//! Two timers share one tick.  A timer is due when it has never fired or
//! when strictly more than its period has passed since it last fired.  It is
//! reset at the attempt, whether or not the fetch succeeds, so a failing
//! weather service is retried on the next period rather than every tick.
//!
//! The rain cache is a single-slot `watch` channel: the power loop always
//! sees the latest published snapshot, and a failed fetch publishes nothing,
//! leaving the previous value in place.

use chrono::{DateTime, Duration, Local};
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::alert::{raise, AlertSink};
use crate::csvlog::WeatherLog;
use crate::model::{Alert, WeatherSnapshot};
use crate::state::SharedState;
use crate::weather::WeatherSource;

/// Rainfall the power loop should use given the current cache slot.
pub fn cached_rain(slot: &Option<WeatherSnapshot>) -> f64 {
    slot.map(|s| s.rainfall_mm).unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RefreshClock {
    pub last_hourly: Option<DateTime<Local>>,
    pub last_daily: Option<DateTime<Local>>,
}

fn due(last: Option<DateTime<Local>>, now: DateTime<Local>, period: Duration) -> bool {
    match last {
        None => true,
        Some(last) => now - last > period,
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct WeatherScheduler<W: WeatherSource, A: AlertSink> {
    source: W,
    sink: A,
    log: WeatherLog,
    clock: RefreshClock,
    hourly: Duration,
    daily: Duration,
    lawn_alert_mm: f64,
    rain_tx: watch::Sender<Option<WeatherSnapshot>>,
    board: SharedState,
}

impl<W: WeatherSource, A: AlertSink> WeatherScheduler<W, A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: W,
        sink: A,
        log: WeatherLog,
        hourly_sec: u64,
        daily_sec: u64,
        lawn_alert_mm: f64,
        rain_tx: watch::Sender<Option<WeatherSnapshot>>,
        board: SharedState,
    ) -> Self {
        Self {
            source,
            sink,
            log,
            clock: RefreshClock::default(),
            hourly: Duration::seconds(hourly_sec as i64),
            daily: Duration::seconds(daily_sec as i64),
            lawn_alert_mm,
            rain_tx,
            board,
        }
    }

    #[cfg(test)]
    pub fn clock(&self) -> RefreshClock {
        self.clock
    }

    /// Run whichever refreshes are due at `now`.
    pub async fn poll(&mut self, now: DateTime<Local>) {
        if due(self.clock.last_hourly, now, self.hourly) {
            self.clock.last_hourly = Some(now);
            self.board.write().await.last_hourly_check = Some(now);
            self.refresh_day(now).await;
        }

        if due(self.clock.last_daily, now, self.daily) {
            self.clock.last_daily = Some(now);
            self.board.write().await.last_daily_check = Some(now);
            self.check_lawn(now).await;
        }
    }

    async fn refresh_day(&self, now: DateTime<Local>) {
        let day = match self.source.fetch_day().await {
            Ok(day) => day,
            Err(e) => {
                error!("weather refresh failed, keeping cached rain: {e:#}");
                self.board
                    .write()
                    .await
                    .record_error(format!("weather refresh failed: {e:#}"));
                return;
            }
        };

        let snapshot = WeatherSnapshot {
            ts: now,
            rainfall_mm: day.rainfall_mm,
            soil_moisture: day.soil_moisture,
        };
        info!(
            rainfall_mm = format!("{:.2}", snapshot.rainfall_mm),
            "weather refreshed"
        );

        if let Err(e) = self.log.append(&snapshot) {
            error!(path = %self.log.path().display(), "failed to log weather: {e:#}");
        }
        self.rain_tx.send_replace(Some(snapshot));
        self.board.write().await.record_weather(snapshot);
    }

    async fn check_lawn(&self, now: DateTime<Local>) {
        let rain_7d = match self.source.fetch_week_rain().await {
            Ok(mm) => mm,
            Err(e) => {
                // No total means no verdict; a dry-lawn alert needs a real figure.
                error!("weekly rainfall fetch failed: {e:#}");
                self.board
                    .write()
                    .await
                    .record_error(format!("weekly rainfall fetch failed: {e:#}"));
                return;
            }
        };

        info!(rain_7d_mm = format!("{rain_7d:.2}"), "weekly rainfall checked");
        self.board.write().await.record_week_rain(rain_7d);

        if rain_7d < self.lawn_alert_mm {
            raise(&self.sink, &self.board, Alert::lawn_watering(now, rain_7d)).await;
        }
    }

    /// Poll every `tick` until `shutdown` flips to true.  An in-flight poll
    /// always completes before the worker exits.
    pub async fn run(mut self, tick: StdDuration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            hourly_sec = self.hourly.num_seconds(),
            daily_sec = self.daily.num_seconds(),
            "weather worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.poll(Local::now()).await;
        }

        info!("weather worker stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
