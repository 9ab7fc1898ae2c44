//! Tasmota-flashed plug reached through an MQTT broker.
//!
//! The plug publishes energy telemetry on `tele/<topic>/SENSOR` and answers
//! `Status 10` requests on `stat/<topic>/STATUS10`.  A background task keeps
//! the most recent reading; reads nudge the plug for a fresh one and return
//! whatever arrived within [`MAX_READING_AGE`].

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::PowerSource;

pub const MAX_READING_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Reading {
    at: Instant,
    watts: f64,
}

pub struct TasmotaPlug {
    client: AsyncClient,
    device: String,
    latest: watch::Receiver<Option<Reading>>,
}

impl TasmotaPlug {
    /// Connect to the broker and start tracking `device`'s energy readings.
    /// Must be called from within a tokio runtime.
    pub fn connect(host: &str, port: u16, device: &str) -> Result<Self> {
        let mut options = MqttOptions::new(format!("sumpwatch-{device}"), host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let (tx, latest) = watch::channel(None);

        let task_client = client.clone();
        let task_device = device.to_string();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(device = %task_device, "plug mqtt connected");
                        // Subscriptions do not survive a clean-session reconnect.
                        for topic in [
                            format!("tele/{task_device}/SENSOR"),
                            format!("stat/{task_device}/STATUS10"),
                        ] {
                            if let Err(e) = task_client.try_subscribe(&topic, QoS::AtLeastOnce)
                            {
                                warn!(%topic, "plug mqtt subscribe failed: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        if !is_energy_topic(&p.topic, &task_device) {
                            continue;
                        }
                        match parse_power(&p.payload) {
                            Ok(watts) => {
                                tx.send_replace(Some(Reading {
                                    at: Instant::now(),
                                    watts,
                                }));
                            }
                            Err(e) => debug!(topic = %p.topic, "ignoring plug payload: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("plug mqtt error: {e}. reconnecting...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            device: device.to_string(),
            latest,
        })
    }
}

impl PowerSource for TasmotaPlug {
    async fn read_watts(&mut self) -> Result<f64> {
        // Ask for a fresh reading; the answer lands on a later tick.
        if let Err(e) = self.client.try_publish(
            format!("cmnd/{}/Status", self.device),
            QoS::AtMostOnce,
            false,
            "10",
        ) {
            debug!(device = %self.device, "status request not queued: {e}");
        }

        let latest = *self.latest.borrow();
        fresh_watts(latest, Instant::now())
    }

    async fn turn_off(&mut self) -> Result<()> {
        self.client
            .publish(
                format!("cmnd/{}/POWER", self.device),
                QoS::AtLeastOnce,
                false,
                "OFF",
            )
            .await
            .context("failed to publish power-off")
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// True for "tele/<device>/SENSOR" and "stat/<device>/STATUS10".
fn is_energy_topic(topic: &str, device: &str) -> bool {
    let parts: Vec<&str> = topic.split('/').collect();
    matches!(
        parts.as_slice(),
        ["tele", d, "SENSOR"] | ["stat", d, "STATUS10"] if *d == device
    )
}

/// Extract `ENERGY.Power` from a SENSOR or STATUS10 payload.  Multi-channel
/// devices report an array; channels are summed.
fn parse_power(payload: &[u8]) -> Result<f64> {
    let v: Value = serde_json::from_slice(payload).context("payload is not json")?;
    let energy = if v["ENERGY"].is_object() {
        &v["ENERGY"]
    } else {
        &v["StatusSNS"]["ENERGY"]
    };
    match &energy["Power"] {
        Value::Number(n) => n.as_f64().context("power is not a number"),
        Value::Array(channels) => channels.iter().try_fold(0.0, |acc, c| {
            c.as_f64()
                .map(|w| acc + w)
                .context("power channel is not a number")
        }),
        _ => bail!("payload has no ENERGY.Power"),
    }
}

fn fresh_watts(latest: Option<Reading>, now: Instant) -> Result<f64> {
    match latest {
        None => bail!("no power reading received from plug yet"),
        Some(r) if now.saturating_duration_since(r.at) > MAX_READING_AGE => bail!(
            "latest plug reading is {}s old",
            now.saturating_duration_since(r.at).as_secs()
        ),
        Some(r) => Ok(r.watts),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
