mod alert;
mod config;
mod csvlog;
mod logging;
mod model;
mod monitor;
mod plug;
mod refresh;
mod runner;
mod state;
#[cfg(test)]
mod testing;
mod weather;
mod web;

use anyhow::{Context, Result};
use chrono::Local;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use alert::{Notifier, Pushbullet};
use csvlog::{AlertLog, PowerLog, WeatherLog};
use monitor::PowerMonitor;
use plug::Plug;
use refresh::WeatherScheduler;
use runner::Runner;
use state::StatusBoard;
use weather::OpenMeteo;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // ── Config ──────────────────────────────────────────────────────
    // Errors before tracing is up reach stderr through main's return.
    let cfg = config::load_from_env()?;
    let thresholds = cfg.tuning.thresholds;
    let timing = cfg.tuning.timing;

    // ── Logs ────────────────────────────────────────────────────────
    std::fs::create_dir_all(&cfg.log_dir)
        .with_context(|| format!("failed to create log dir {}", cfg.log_dir.display()))?;
    let _log_guard = logging::init(&cfg.log_dir)?;
    cfg.log_config();
    let power_log = PowerLog::open(&cfg.log_dir)?;
    let weather_log = WeatherLog::open(&cfg.log_dir);
    let alert_log = AlertLog::open(&cfg.log_dir);

    // ── Capabilities ────────────────────────────────────────────────
    let notifier = Notifier::new(alert_log, Pushbullet::new(&cfg.pushbullet_api_key)?);
    let weather = OpenMeteo::new(
        cfg.latitude,
        cfg.longitude,
        Duration::from_secs(timing.weather_timeout_sec),
    )?;
    let plug = Plug::from_config(&cfg.plug)?;

    // ── Shared state (ephemeral, for the status api) ────────────────
    let board = StatusBoard::shared();
    board
        .write()
        .await
        .record_system("monitor started".to_string());

    let (rain_tx, rain_rx) = watch::channel(None);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tick = Duration::from_secs(timing.tick_sec);

    // ── Weather worker ──────────────────────────────────────────────
    let scheduler = WeatherScheduler::new(
        weather,
        notifier.clone(),
        weather_log,
        timing.hourly_refresh_sec,
        timing.daily_refresh_sec,
        thresholds.lawn_alert_mm,
        rain_tx,
        board.clone(),
    );
    let weather_task = tokio::spawn(scheduler.run(tick, shutdown_rx.clone()));

    // ── Status api ──────────────────────────────────────────────────
    if cfg.web_port != 0 {
        let web_state = board.clone();
        let port = cfg.web_port;
        tokio::spawn(async move {
            if let Err(e) = web::serve(web_state, port).await {
                error!("status api stopped: {e:#}");
            }
        });
    }

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c, running until killed: {e}");
            // Dropping the sender would read as a shutdown.
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
        shutdown_tx.send_replace(true);
    });

    // ── Monitoring loop ─────────────────────────────────────────────
    let runner = Runner::new(
        PowerMonitor::new(thresholds, Local::now()),
        plug,
        rain_rx,
        power_log,
        notifier,
        board,
        Duration::from_secs(timing.power_timeout_sec),
    );
    runner.run(tick, shutdown_rx).await;

    weather_task.await.context("weather worker panicked")?;
    info!("monitor stopped");
    Ok(())
}

