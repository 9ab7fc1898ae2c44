//! Pump power monitor: turns a stream of power samples into run/idle
//! episodes and decides when each power-related alert fires.
//!
//! The monitor is a pure decision engine.  [`PowerMonitor::observe`] returns
//! the [`Action`]s a tick calls for (log the sample, send an alert, cut the
//! plug) and the caller performs them.  A failed action never feeds back into
//! the state: alerts latch on detection, not on delivery.
//!
//! ## State machine
//!
//! ```text
//!              ──[watts > threshold]── "power draw detected" ─▶
//! Idle{no_power_alerted}                                 Running{since, long_run_alerted}
//!              ◀──────────────[watts <= threshold]────────────
//!
//! Idle:    silent > no_power_sec && rain >= rain_alert_mm && !latched → alert, latch
//! Running: elapsed > long_run_sec && !latched → alert + shut off, latch
//! ```
//!
//! Each latch lives inside the state it belongs to, so leaving that state
//! clears it.

use chrono::{DateTime, Duration, Local};
use serde::Serialize;

use crate::config::Thresholds;
use crate::model::{Alert, PowerSample};

// ---------------------------------------------------------------------------
// Episode state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Episode {
    /// No draw above threshold.  `no_power_alerted` latches the
    /// no-draw-despite-rain alert for this idle stretch.
    Idle { no_power_alerted: bool },
    /// Draw above threshold since `since`.  `long_run_alerted` latches the
    /// long-run alert (and its shutoff) for this episode.
    Running {
        since: DateTime<Local>,
        long_run_alerted: bool,
    },
}

/// Side effects requested by one observation, in the order they should be
/// carried out.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    LogSample(PowerSample),
    Alert(Alert),
    ShutOff,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PowerMonitor {
    thresholds: Thresholds,
    episode: Episode,
    last_power_time: DateTime<Local>,
}

impl PowerMonitor {
    /// A fresh monitor starts idle and treats `started_at` as the last time
    /// power was seen, so it cannot raise a no-power alert straight away.
    pub fn new(thresholds: Thresholds, started_at: DateTime<Local>) -> Self {
        Self {
            thresholds,
            episode: Episode::Idle {
                no_power_alerted: false,
            },
            last_power_time: started_at,
        }
    }

    pub fn episode(&self) -> Episode {
        self.episode
    }

    pub fn last_power_time(&self) -> DateTime<Local> {
        self.last_power_time
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        matches!(self.episode, Episode::Running { .. })
    }

    /// Feed one power sample together with the currently cached 24h rainfall.
    pub fn observe(&mut self, sample: PowerSample, rain_mm: f64) -> Vec<Action> {
        if sample.watts > self.thresholds.power_threshold_w {
            self.observe_active(sample)
        } else {
            self.observe_idle(sample.ts, rain_mm)
        }
    }

    fn observe_active(&mut self, sample: PowerSample) -> Vec<Action> {
        let now = sample.ts;
        let mut actions = vec![Action::LogSample(sample)];

        match &mut self.episode {
            Episode::Idle { .. } => {
                actions.push(Action::Alert(Alert::power_detected(now, sample.watts)));
                self.episode = Episode::Running {
                    since: now,
                    long_run_alerted: false,
                };
            }
            Episode::Running {
                since,
                long_run_alerted,
            } => {
                if !*long_run_alerted && exceeds(now - *since, self.thresholds.long_run_sec) {
                    actions.push(Action::Alert(Alert::long_run(
                        now,
                        self.thresholds.long_run_sec,
                    )));
                    actions.push(Action::ShutOff);
                    *long_run_alerted = true;
                }
            }
        }

        self.last_power_time = now;
        actions
    }

    fn observe_idle(&mut self, now: DateTime<Local>, rain_mm: f64) -> Vec<Action> {
        // Re-entering idle is unconditional; it also drops the long-run latch.
        let mut no_power_alerted = match self.episode {
            Episode::Idle { no_power_alerted } => no_power_alerted,
            Episode::Running { .. } => false,
        };

        let mut actions = Vec::new();
        if !no_power_alerted
            && exceeds(now - self.last_power_time, self.thresholds.no_power_sec)
            && rain_mm >= self.thresholds.rain_alert_mm
        {
            actions.push(Action::Alert(Alert::no_power_with_rain(
                now,
                self.thresholds.no_power_sec,
                rain_mm,
            )));
            no_power_alerted = true;
        }

        self.episode = Episode::Idle { no_power_alerted };
        actions
    }
}

/// `elapsed > secs`, strictly.
fn exceeds(elapsed: Duration, secs: u64) -> bool {
    elapsed > Duration::seconds(secs as i64)
}

// ===========================================================================
// Tests
// ===========================================================================
