//! SMS transport — JSON POST to a configurable HTTP gateway.

use revloop_core::config::SmsChannelConfig;
use revloop_core::types::DeliveryError;

/// HTTP SMS gateway sender.
pub struct SmsSender {
    config: SmsChannelConfig,
    client: reqwest::Client,
}

impl SmsSender {
    pub fn new(config: SmsChannelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Send one SMS.
    pub async fn send_sms(&self, to: &str, body: &str) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "to": to,
                "from": self.config.from_number,
                "body": body,
            }))
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("SMS gateway unreachable: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            tracing::info!("📤 SMS sent to {to}");
            return Ok(());
        }
        let detail = resp.text().await.unwrap_or_default();
        let detail: String = detail.chars().take(200).collect();
        if transient_status(status.as_u16()) {
            Err(DeliveryError::Transient(format!(
                "SMS gateway {status}: {detail}"
            )))
        } else {
            Err(DeliveryError::Permanent(format!(
                "SMS gateway {status}: {detail}"
            )))
        }
    }
}

/// 429 and 5xx clear on their own; other 4xx rejections (bad number,
/// bad credentials) never will.
fn transient_status(code: u16) -> bool {
    code == 429 || (500..=599).contains(&code)
}
