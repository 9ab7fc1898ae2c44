//! Alert delivery.  Every alert is recorded durably in the alert log and the
//! operational log before the push notification is attempted, so a failed
//! push never loses the record.

use anyhow::{Context, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

use crate::csvlog::AlertLog;
use crate::model::Alert;
use crate::state::SharedState;

pub const PUSHBULLET_URL: &str = "https://api.pushbullet.com/v2/pushes";
const PUSH_TITLE: &str = "Power Monitor Alert";
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub trait AlertSink: Clone + Send + Sync + 'static {
    fn send(&self, alert: &Alert) -> impl Future<Output = Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// Pushbullet
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PushNote<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Clone)]
pub struct Pushbullet {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl Pushbullet {
    pub fn new(api_key: &str) -> Result<Self> {
        Self::with_url(PUSHBULLET_URL, api_key)
    }

    pub fn with_url(url: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .context("failed to build push http client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub async fn push_note(&self, title: &str, body: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .header("Access-Token", &self.api_key)
            .json(&PushNote {
                kind: "note",
                title,
                body,
            })
            .send()
            .await
            .context("push request failed")?
            .error_for_status()
            .context("push service rejected the note")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifier: durable record + push
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Notifier {
    record: Arc<Mutex<AlertLog>>,
    push: Pushbullet,
}

impl Notifier {
    pub fn new(record: AlertLog, push: Pushbullet) -> Self {
        Self {
            record: Arc::new(Mutex::new(record)),
            push,
        }
    }

    fn record(&self, alert: &Alert) -> Result<()> {
        let log = self
            .record
            .lock()
            .map_err(|_| anyhow::anyhow!("alert log lock poisoned"))?;
        log.append(alert)
    }
}

impl AlertSink for Notifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        warn!(kind = alert.kind.as_str(), "Alert: {}", alert.message);

        // Recording and pushing are independent; try both, report the first
        // failure.
        let recorded = self.record(alert).context("failed to record alert");
        let pushed = self
            .push
            .push_note(PUSH_TITLE, &alert.message)
            .await
            .context("failed to push alert");
        recorded.and(pushed)
    }
}

/// Deliver `alert` through `sink` and note it on the status board.
/// Delivery failures are logged, never propagated.
pub async fn raise<A: AlertSink>(sink: &A, board: &SharedState, alert: Alert) {
    board.write().await.record_alert(&alert);
    if let Err(e) = sink.send(&alert).await {
        error!(kind = alert.kind.as_str(), "alert delivery failed: {e:#}");
        board
            .write()
            .await
            .record_error(format!("alert delivery failed: {e:#}"));
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Local;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sumpwatch-alert-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    type Seen = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn push_server(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let router = Router::new().route(
            "/v2/pushes",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let captured = Arc::clone(&captured);
                async move {
                    let token = headers
                        .get("Access-Token")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    captured.lock().unwrap().push((token, body));
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}/v2/pushes"), seen)
    }

    #[tokio::test]
    async fn push_note_posts_titled_note_with_token() {
        let (url, seen) = push_server(StatusCode::OK).await;
        let push = Pushbullet::with_url(&url, "o.secret").unwrap();
        push.push_note("Title", "Body text").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.as_deref(), Some("o.secret"));
        assert_eq!(seen[0].1["type"], "note");
        assert_eq!(seen[0].1["title"], "Title");
        assert_eq!(seen[0].1["body"], "Body text");
    }

    #[tokio::test]
    async fn notifier_records_then_pushes() {
        let dir = temp_dir("ok");
        let (url, seen) = push_server(StatusCode::OK).await;
        let notifier = Notifier::new(
            AlertLog::open(&dir),
            Pushbullet::with_url(&url, "k").unwrap(),
        );

        notifier
            .send(&Alert::power_detected(Local::now(), 0.25))
            .await
            .unwrap();

        let csv = std::fs::read_to_string(dir.join(crate::csvlog::ALERT_FILE)).unwrap();
        assert!(csv.contains("power_detected,Power draw detected: 0.25W"));
        assert_eq!(seen.lock().unwrap()[0].1["title"], PUSH_TITLE);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn failed_push_still_records_alert() {
        let dir = temp_dir("push-fails");
        let (url, _seen) = push_server(StatusCode::UNAUTHORIZED).await;
        let notifier = Notifier::new(
            AlertLog::open(&dir),
            Pushbullet::with_url(&url, "bad").unwrap(),
        );

        let err = notifier
            .send(&Alert::lawn_watering(Local::now(), 3.0))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to push alert"));

        let csv = std::fs::read_to_string(dir.join(crate::csvlog::ALERT_FILE)).unwrap();
        assert!(csv.contains("lawn_watering"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
