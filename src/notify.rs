//! Notification emitter — best-effort signal to the agent's sink.
//!
//! One event per terminal transition: `POST {message}` to the configured
//! loopback endpoint, falling back to an append-only file. Neither sink is
//! reliable; the store row is the authoritative record. Emission runs in a
//! spawned task and never blocks or reverts a state transition.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::request::RequestState;

pub struct Notifier {
    client: reqwest::Client,
    endpoint: Option<String>,
    fallback_file: PathBuf,
}

impl Notifier {
    pub fn new(config: &NotifyConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            endpoint: config.endpoint.clone(),
            fallback_file: config.fallback_file.clone(),
        }
    }

    /// Fire-and-forget emission for a terminal state.
    pub fn emit(&self, request_id: &str, state: RequestState, summary: &str) {
        let message = format!("request {request_id} {state}: {summary}");
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let fallback = self.fallback_file.clone();
        tokio::spawn(async move {
            deliver(&client, endpoint.as_deref(), &fallback, &message).await;
        });
    }
}

async fn deliver(
    client: &reqwest::Client,
    endpoint: Option<&str>,
    fallback_file: &Path,
    message: &str,
) {
    if let Some(endpoint) = endpoint {
        let body = serde_json::json!({ "message": message });
        match client.post(endpoint).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Notification delivered to {endpoint}");
                return;
            }
            Ok(response) => {
                warn!("Notification endpoint returned {}", response.status());
            }
            Err(e) => {
                warn!("Notification POST failed: {e}");
            }
        }
    }
    append_fallback(fallback_file, message);
}

fn append_fallback(fallback_file: &Path, message: &str) {
    if let Some(parent) = fallback_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let line = format!("{} {message}\n", Utc::now().to_rfc3339());
    let appended = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(fallback_file)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = appended {
        warn!(
            "Notification fallback write failed ({}): {e}",
            fallback_file.display()
        );
    }
}
