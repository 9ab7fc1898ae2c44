//! Simulated sump pump for local development.
//!
//! Models a float-switch pump: long idle stretches broken by short pump-out
//! cycles at a few hundred watts with small electrical noise.  Every
//! [`STUCK_EVERY`]th cycle the float sticks and the pump keeps running until
//! it is switched off, which exercises the long-run shutoff path.

use anyhow::Result;
use std::time::{Duration, Instant};

use super::PowerSource;

const IDLE_SECS: std::ops::Range<u64> = 30..180;
const RUN_SECS: std::ops::Range<u64> = 8..25;
const STUCK_EVERY: u32 = 5;
const RUN_WATTS: f64 = 420.0;
const NOISE_WATTS: f64 = 15.0;
/// Residual draw of the plug's own electronics while the pump is off.
const STANDBY_WATTS: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle { until: Instant },
    Running { until: Option<Instant> },
}

pub struct SimPlug {
    rng: fastrand::Rng,
    phase: Phase,
    cycles: u32,
}

impl SimPlug {
    pub fn new() -> Self {
        Self::with_rng(fastrand::Rng::new(), Instant::now())
    }

    fn with_rng(mut rng: fastrand::Rng, now: Instant) -> Self {
        let until = now + Duration::from_secs(rng.u64(IDLE_SECS));
        Self {
            rng,
            phase: Phase::Idle { until },
            cycles: 0,
        }
    }

    /// Advance the model to `now` and return the draw at that instant.
    fn sample_at(&mut self, now: Instant) -> f64 {
        match self.phase {
            Phase::Idle { until } if now >= until => {
                self.cycles += 1;
                let stuck = self.cycles % STUCK_EVERY == 0;
                let until = (!stuck).then(|| now + Duration::from_secs(self.rng.u64(RUN_SECS)));
                self.phase = Phase::Running { until };
            }
            Phase::Running { until: Some(until) } if now >= until => {
                self.idle_from(now);
            }
            _ => {}
        }

        match self.phase {
            Phase::Idle { .. } => STANDBY_WATTS,
            Phase::Running { .. } => {
                let noise = (self.rng.f64() * 2.0 - 1.0) * NOISE_WATTS;
                RUN_WATTS + noise
            }
        }
    }

    fn idle_from(&mut self, now: Instant) {
        let until = now + Duration::from_secs(self.rng.u64(IDLE_SECS));
        self.phase = Phase::Idle { until };
    }
}

impl PowerSource for SimPlug {
    async fn read_watts(&mut self) -> Result<f64> {
        Ok(self.sample_at(Instant::now()))
    }

    async fn turn_off(&mut self) -> Result<()> {
        tracing::info!("[sim-plug] relay OFF");
        self.idle_from(Instant::now());
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
