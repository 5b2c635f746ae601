//! Fire-and-forget telemetry.
//!
//! Events are POSTed to an optional sink on a detached task. Failures are
//! swallowed and logged — telemetry must never fail a primary operation.

use chrono::Utc;
use revloop_core::config::TelemetryConfig;

#[derive(Clone)]
pub struct Telemetry {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl Telemetry {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone().filter(|e| !e.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    /// No-op sink, for tests and unconfigured deployments.
    pub fn disabled() -> Self {
        Self {
            endpoint: None,
            client: reqwest::Client::new(),
        }
    }

    /// Emit one event. Returns immediately; the POST happens on a spawned
    /// task with a short timeout, and any error is logged and dropped.
    pub fn emit(&self, event_type: &str, payload: serde_json::Value) {
        let Some(url) = self.endpoint.clone() else {
            return;
        };
        let client = self.client.clone();
        let body = serde_json::json!({
            "event": event_type,
            "payload": payload,
            "at": Utc::now().to_rfc3339(),
        });
        let event_type = event_type.to_string();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&body)
                .timeout(std::time::Duration::from_secs(5))
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!("Telemetry sink returned {} for '{event_type}'", resp.status());
                }
                Err(e) => {
                    tracing::warn!("Telemetry send failed for '{event_type}': {e}");
                }
            }
        });
    }
}
