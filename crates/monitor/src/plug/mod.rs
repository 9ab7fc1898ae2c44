//! Smart-plug power sources.  Each backend reads the instantaneous draw in
//! watts and can switch the outlet off; the monitoring loop bounds every
//! call with its own timeout.

mod kasa;
mod sim;
mod tasmota;

pub use kasa::KasaPlug;
pub use sim::SimPlug;
pub use tasmota::TasmotaPlug;

use anyhow::Result;
use std::future::Future;
use tracing::info;

use crate::config::{PlugConfig, PlugKind};

pub trait PowerSource: Send {
    fn read_watts(&mut self) -> impl Future<Output = Result<f64>> + Send;
    fn turn_off(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// The configured plug backend.
pub enum Plug {
    Kasa(KasaPlug),
    Tasmota(TasmotaPlug),
    Sim(SimPlug),
}

impl Plug {
    pub fn from_config(cfg: &PlugConfig) -> Result<Self> {
        let plug = match cfg.kind {
            PlugKind::Kasa => Self::Kasa(KasaPlug::new(&cfg.addr)),
            PlugKind::Tasmota => Self::Tasmota(TasmotaPlug::connect(
                &cfg.mqtt_host,
                cfg.mqtt_port,
                &cfg.addr,
            )?),
            PlugKind::Sim => Self::Sim(SimPlug::new()),
        };
        info!(kind = ?cfg.kind, addr = %cfg.addr, "plug ready");
        Ok(plug)
    }
}

impl PowerSource for Plug {
    async fn read_watts(&mut self) -> Result<f64> {
        match self {
            Self::Kasa(p) => p.read_watts().await,
            Self::Tasmota(p) => p.read_watts().await,
            Self::Sim(p) => p.read_watts().await,
        }
    }

    async fn turn_off(&mut self) -> Result<()> {
        match self {
            Self::Kasa(p) => p.turn_off().await,
            Self::Tasmota(p) => p.turn_off().await,
            Self::Sim(p) => p.turn_off().await,
        }
    }
}
