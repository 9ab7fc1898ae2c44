//! Monitoring loop: one power reading per tick, fed through the
//! [`PowerMonitor`] together with the cached rainfall, with the resulting
//! actions carried out against the plug, the power log and the alert sink.

use chrono::{DateTime, Local};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alert::{raise, AlertSink};
use crate::csvlog::PowerLog;
use crate::model::{PowerSample, WeatherSnapshot};
use crate::monitor::{Action, PowerMonitor};
use crate::plug::PowerSource;
use crate::refresh::cached_rain;
use crate::state::SharedState;

pub struct Runner<P: PowerSource, A: AlertSink> {
    monitor: PowerMonitor,
    plug: P,
    rain_rx: watch::Receiver<Option<WeatherSnapshot>>,
    log: PowerLog,
    sink: A,
    board: SharedState,
    power_timeout: Duration,
    /// Set while consecutive reads fail, so the board gets one event per outage.
    read_failing: bool,
}

impl<P: PowerSource, A: AlertSink> Runner<P, A> {
    pub fn new(
        monitor: PowerMonitor,
        plug: P,
        rain_rx: watch::Receiver<Option<WeatherSnapshot>>,
        log: PowerLog,
        sink: A,
        board: SharedState,
        power_timeout: Duration,
    ) -> Self {
        Self {
            monitor,
            plug,
            rain_rx,
            log,
            sink,
            board,
            power_timeout,
            read_failing: false,
        }
    }

    #[cfg(test)]
    pub fn monitor(&self) -> &PowerMonitor {
        &self.monitor
    }

    /// One pass of the loop.  A failed or timed-out read skips the tick with
    /// the monitor untouched.
    pub async fn tick(&mut self, now: DateTime<Local>) {
        let watts = match timeout(self.power_timeout, self.plug.read_watts()).await {
            Ok(Ok(watts)) => watts,
            Ok(Err(e)) => {
                self.read_failed(format!("power read failed: {e:#}")).await;
                return;
            }
            Err(_) => {
                self.read_failed(format!(
                    "power read timed out after {}s",
                    self.power_timeout.as_secs_f64()
                ))
                .await;
                return;
            }
        };

        if self.read_failing {
            self.read_failing = false;
            info!("power readings recovered");
            self.board
                .write()
                .await
                .record_system("power readings recovered".to_string());
        }

        let sample = PowerSample { ts: now, watts };
        let rain_mm = cached_rain(&self.rain_rx.borrow());
        debug!(watts, rain_mm, "power sample");

        // Alerts go out once the plug has been dealt with; a slow push must
        // not hold the relay on.
        let mut alerts = Vec::new();
        for action in self.monitor.observe(sample, rain_mm) {
            match action {
                Action::LogSample(sample) => {
                    if let Err(e) = self.log.append(&sample) {
                        error!("failed to log power sample: {e:#}");
                    }
                }
                Action::Alert(alert) => alerts.push(alert),
                Action::ShutOff => self.shut_off().await,
            }
        }
        for alert in alerts {
            raise(&self.sink, &self.board, alert).await;
        }

        self.board.write().await.record_power(
            sample,
            self.monitor.episode(),
            self.monitor.last_power_time(),
        );
    }

    async fn read_failed(&mut self, detail: String) {
        warn!("{detail}, skipping tick");
        if !self.read_failing {
            self.read_failing = true;
            self.board.write().await.record_error(detail);
        }
    }

    /// Single attempt; the long-run latch is already set, so a failure here
    /// is reported and not retried.
    async fn shut_off(&mut self) {
        let detail = match timeout(self.power_timeout, self.plug.turn_off()).await {
            Ok(Ok(())) => {
                info!("plug switched off after long run");
                self.board
                    .write()
                    .await
                    .record_system("plug switched off after long run".to_string());
                return;
            }
            Ok(Err(e)) => format!("plug shutoff failed: {e:#}"),
            Err(_) => "plug shutoff timed out".to_string(),
        };
        error!("{detail}");
        self.board.write().await.record_error(detail);
    }

    /// Tick every `tick` until `shutdown` flips to true.  A tick in progress
    /// always runs to completion first.
    pub async fn run(mut self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick_ms = tick.as_millis() as u64, "monitoring loop started");

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
            self.tick(Local::now()).await;
        }

        info!("monitoring loop stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;
    use crate::model::AlertKind;
    use crate::monitor::Episode;
    use crate::state::{EventKind, StatusBoard};
    use crate::csvlog::WeatherLog;
    use crate::model::Alert;
    use crate::refresh::WeatherScheduler;
    use crate::testing::{RecordingSink, Reply, ScriptedPlug, StalledWeather};
    use anyhow::Result;
    use std::sync::{Arc, Mutex};
    use chrono::TimeZone;
    use std::path::{Path, PathBuf};

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sumpwatch-runner-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Local> {
        t0() + chrono::Duration::seconds(secs)
    }

    struct Harness {
        runner: Runner<ScriptedPlug, RecordingSink>,
        plug: ScriptedPlug,
        sink: RecordingSink,
        rain_tx: watch::Sender<Option<WeatherSnapshot>>,
        board: SharedState,
        dir: PathBuf,
    }

    fn harness(name: &str, plug: ScriptedPlug) -> Harness {
        let dir = temp_dir(name);
        let sink = RecordingSink::default();
        let board = StatusBoard::shared();
        let (rain_tx, rain_rx) = watch::channel(None);
        let runner = Runner::new(
            PowerMonitor::new(Thresholds::default(), t0()),
            plug.clone(),
            rain_rx,
            PowerLog::open(&dir).unwrap(),
            sink.clone(),
            board.clone(),
            TIMEOUT,
        );
        Harness {
            runner,
            plug,
            sink,
            rain_tx,
            board,
            dir,
        }
    }

    fn power_rows(dir: &Path) -> usize {
        let csv = std::fs::read_to_string(dir.join(crate::csvlog::POWER_FILE)).unwrap();
        csv.lines().count() - 1
    }

    fn rain_snapshot(mm: f64) -> Option<WeatherSnapshot> {
        Some(WeatherSnapshot {
            ts: t0(),
            rainfall_mm: mm,
            soil_moisture: [0.3; 5],
        })
    }

    // -- long run ---------------------------------------------------------

    #[tokio::test]
    async fn seventy_seconds_of_draw_shuts_off_once() {
        let plug = ScriptedPlug::new(std::iter::repeat(Reply::Watts(300.0)).take(70));
        let mut h = harness("long-run", plug);
        for s in 0..70 {
            h.runner.tick(at(s)).await;
        }

        assert_eq!(
            h.sink.kinds(),
            vec![AlertKind::PowerDetected, AlertKind::LongRun]
        );
        assert_eq!(h.plug.turn_offs(), 1);
        assert_eq!(power_rows(&h.dir), 70);

        let board = h.board.read().await;
        assert_eq!(
            board.pump,
            Episode::Running {
                since: t0(),
                long_run_alerted: true,
            }
        );
        assert_eq!(board.last_sample.unwrap().ts, at(69));
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn failed_shutoff_is_not_retried() {
        let mut plug = ScriptedPlug::new(std::iter::repeat(Reply::Watts(300.0)).take(90));
        plug.fail_turn_off = true;
        let mut h = harness("shutoff-fails", plug);
        for s in 0..90 {
            h.runner.tick(at(s)).await;
        }

        assert_eq!(h.plug.turn_offs(), 1);
        assert_eq!(h.sink.kinds().len(), 2);
        assert!(h
            .board
            .read()
            .await
            .events
            .iter()
            .any(|e| e.kind == EventKind::Error && e.detail.contains("shutoff failed")));
        std::fs::remove_dir_all(&h.dir).ok();
    }

    // -- read failures ----------------------------------------------------

    #[tokio::test]
    async fn failed_read_skips_tick_without_state_change() {
        let plug = ScriptedPlug::new([Reply::Watts(300.0), Reply::Fail, Reply::Fail]);
        let mut h = harness("read-fails", plug);
        h.runner.tick(at(0)).await;
        let before = h.runner.monitor().episode();

        h.runner.tick(at(1)).await;
        h.runner.tick(at(2)).await;

        assert_eq!(h.runner.monitor().episode(), before);
        assert_eq!(h.runner.monitor().last_power_time(), at(0));
        assert_eq!(power_rows(&h.dir), 1);

        // One board event per outage.
        let errors = h
            .board
            .read()
            .await
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Error)
            .count();
        assert_eq!(errors, 1);
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn hung_read_is_bounded_by_timeout() {
        let plug = ScriptedPlug::new([Reply::Hang, Reply::Watts(5.0)]);
        let mut h = harness("hang", plug);

        tokio::time::timeout(Duration::from_secs(2), h.runner.tick(at(0)))
            .await
            .expect("tick should give up on a hung plug");
        assert!(!h.runner.monitor().is_running());
        assert!(h.sink.alerts().is_empty());

        h.runner.tick(at(1)).await;
        assert!(h.runner.monitor().is_running());
        assert_eq!(h.sink.kinds(), vec![AlertKind::PowerDetected]);
        std::fs::remove_dir_all(&h.dir).ok();
    }

    // -- rain cache -------------------------------------------------------

    #[tokio::test]
    async fn uses_cached_rain_for_no_power_alert() {
        let mut h = harness("rain", ScriptedPlug::default());

        h.rain_tx.send_replace(rain_snapshot(9.0));
        h.runner.tick(at(21_601)).await;
        assert!(h.sink.alerts().is_empty());

        h.rain_tx.send_replace(rain_snapshot(15.0));
        h.runner.tick(at(21_602)).await;
        assert_eq!(h.sink.kinds(), vec![AlertKind::NoPowerWithRain]);

        h.runner.tick(at(21_603)).await;
        assert_eq!(h.sink.kinds().len(), 1);
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn empty_rain_cache_counts_as_dry() {
        let mut h = harness("no-rain", ScriptedPlug::default());
        h.runner.tick(at(30_000)).await;
        assert!(h.sink.alerts().is_empty());
        std::fs::remove_dir_all(&h.dir).ok();
    }

    // -- delivery ---------------------------------------------------------

    #[tokio::test]
    async fn undelivered_alert_still_latches() {
        let dir = temp_dir("undelivered");
        let sink = RecordingSink::failing();
        let board = StatusBoard::shared();
        let (_rain_tx, rain_rx) = watch::channel(None);
        let mut runner = Runner::new(
            PowerMonitor::new(Thresholds::default(), t0()),
            ScriptedPlug::new([Reply::Watts(2.0), Reply::Watts(2.0)]),
            rain_rx,
            PowerLog::open(&dir).unwrap(),
            sink.clone(),
            board.clone(),
            TIMEOUT,
        );
        runner.tick(at(0)).await;
        runner.tick(at(1)).await;

        assert_eq!(sink.kinds(), vec![AlertKind::PowerDetected]);
        assert!(runner.monitor().is_running());
        std::fs::remove_dir_all(&dir).ok();
    }

    // -- ordering ---------------------------------------------------------

    /// Notes how many shutoffs the plug had seen when each alert arrived.
    #[derive(Clone)]
    struct ShutoffWitness {
        plug: ScriptedPlug,
        seen: Arc<Mutex<Vec<(AlertKind, usize)>>>,
    }

    impl AlertSink for ShutoffWitness {
        async fn send(&self, alert: &Alert) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((alert.kind, self.plug.turn_offs()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn plug_is_cut_before_long_run_alert_goes_out() {
        let dir = temp_dir("shutoff-first");
        let plug = ScriptedPlug::new(std::iter::repeat(Reply::Watts(300.0)).take(62));
        let sink = ShutoffWitness {
            plug: plug.clone(),
            seen: Arc::default(),
        };
        let (_rain_tx, rain_rx) = watch::channel(None);
        let mut runner = Runner::new(
            PowerMonitor::new(Thresholds::default(), t0()),
            plug.clone(),
            rain_rx,
            PowerLog::open(&dir).unwrap(),
            sink.clone(),
            StatusBoard::shared(),
            TIMEOUT,
        );
        for s in 0..62 {
            runner.tick(at(s)).await;
        }

        assert_eq!(
            *sink.seen.lock().unwrap(),
            vec![(AlertKind::PowerDetected, 0), (AlertKind::LongRun, 1)]
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    // -- weather isolation ------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn stalled_weather_does_not_hold_up_power_sampling() {
        let dir = temp_dir("stalled-weather");
        let sink = RecordingSink::default();
        let board = StatusBoard::shared();
        let (rain_tx, rain_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = watch::channel(false);

        let weather = StalledWeather::default();
        let scheduler = WeatherScheduler::new(
            weather.clone(),
            sink.clone(),
            WeatherLog::open(&dir),
            3600,
            86_400,
            38.1,
            rain_tx,
            board.clone(),
        );
        let weather_task = tokio::spawn(scheduler.run(Duration::from_secs(1), stop_rx.clone()));

        let mut plug = ScriptedPlug::default();
        plug.fallback = 300.0;
        let runner = Runner::new(
            PowerMonitor::new(Thresholds::default(), Local::now()),
            plug,
            rain_rx,
            PowerLog::open(&dir).unwrap(),
            sink.clone(),
            board.clone(),
            TIMEOUT,
        );
        let runner_task = tokio::spawn(runner.run(Duration::from_secs(1), stop_rx));

        tokio::time::sleep(Duration::from_secs(70)).await;
        stop_tx.send_replace(true);
        runner_task.await.unwrap();

        // The first hourly fetch never returned, yet every second was sampled.
        assert_eq!(weather.calls(), 1);
        assert!(power_rows(&dir) >= 70, "only {} samples", power_rows(&dir));
        assert_eq!(sink.kinds(), vec![AlertKind::PowerDetected]);
        assert!(board.read().await.weather.is_none());

        weather_task.abort();
        std::fs::remove_dir_all(&dir).ok();
    }

    // -- run loop ---------------------------------------------------------

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let plug = ScriptedPlug::default();
        let h = harness("run", plug);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(h.runner.run(Duration::from_millis(10), stop_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert!(h.board.read().await.last_sample.is_some());
        std::fs::remove_dir_all(&h.dir).ok();
    }
}
