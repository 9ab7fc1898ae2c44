//! TP-Link Kasa smart plug, local protocol.
//!
//! Each request is a fresh TCP connection to port 9999 carrying one frame:
//! a big-endian `u32` length followed by the JSON command, obfuscated with an
//! XOR autokey cipher (initial key 171).  The reply uses the same framing.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::PowerSource;

pub const KASA_PORT: u16 = 9999;
const INITIAL_KEY: u8 = 171;
/// Replies larger than this are treated as a protocol error.
const MAX_REPLY_LEN: usize = 64 * 1024;

pub struct KasaPlug {
    addr: String,
}

impl KasaPlug {
    /// `addr` is `host`, `host:port`, a bare IP address (v4 or v6) or a
    /// socket address such as `[fe80::1]:9999`.
    pub fn new(addr: &str) -> Self {
        let addr = if let Ok(sock) = addr.parse::<SocketAddr>() {
            sock.to_string()
        } else if let Ok(ip) = addr.parse::<IpAddr>() {
            SocketAddr::new(ip, KASA_PORT).to_string()
        } else if addr.contains(':') {
            addr.to_string()
        } else {
            format!("{addr}:{KASA_PORT}")
        };
        Self { addr }
    }

    async fn request(&self, command: &Value) -> Result<Value> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("failed to connect to plug at {}", self.addr))?;

        let plain = serde_json::to_vec(command)?;
        stream
            .write_all(&frame(&plain))
            .await
            .context("failed to send plug command")?;

        let len = stream
            .read_u32()
            .await
            .context("failed to read plug reply length")? as usize;
        if len > MAX_REPLY_LEN {
            bail!("plug reply of {len} bytes exceeds {MAX_REPLY_LEN}");
        }
        let mut cipher = vec![0u8; len];
        stream
            .read_exact(&mut cipher)
            .await
            .context("failed to read plug reply")?;

        serde_json::from_slice(&decrypt(&cipher)).context("malformed plug reply")
    }
}

impl PowerSource for KasaPlug {
    async fn read_watts(&mut self) -> Result<f64> {
        let reply = self
            .request(&json!({ "emeter": { "get_realtime": {} } }))
            .await?;
        parse_realtime(&reply)
    }

    async fn turn_off(&mut self) -> Result<()> {
        let reply = self
            .request(&json!({ "system": { "set_relay_state": { "state": 0 } } }))
            .await?;
        check_err_code(&reply["system"]["set_relay_state"], "set_relay_state")
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

pub(crate) fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    plain
        .iter()
        .map(|b| {
            key ^= b;
            key
        })
        .collect()
}

pub(crate) fn decrypt(cipher: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    cipher
        .iter()
        .map(|&c| {
            let plain = key ^ c;
            key = c;
            plain
        })
        .collect()
}

fn frame(plain: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + plain.len());
    out.extend_from_slice(&(plain.len() as u32).to_be_bytes());
    out.extend_from_slice(&encrypt(plain));
    out
}

fn check_err_code(section: &Value, what: &str) -> Result<()> {
    if section.is_null() {
        bail!("plug reply has no {what} section");
    }
    match section["err_code"].as_i64() {
        Some(0) | None => Ok(()),
        Some(code) => bail!(
            "plug {what} failed with err_code {code}: {}",
            section["err_msg"].as_str().unwrap_or("no message")
        ),
    }
}

/// Newer firmware reports `power_mw`; older firmware reports `power` in W.
fn parse_realtime(reply: &Value) -> Result<f64> {
    let rt = &reply["emeter"]["get_realtime"];
    check_err_code(rt, "get_realtime")?;
    if let Some(mw) = rt["power_mw"].as_f64() {
        Ok(mw / 1000.0)
    } else if let Some(w) = rt["power"].as_f64() {
        Ok(w)
    } else {
        bail!("plug realtime reply carries no power reading")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
