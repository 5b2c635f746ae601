//! The delivery router — one `Outbound` implementation dispatching to
//! whichever transports the deployment has configured.

use crate::email::EmailSender;
use crate::sms::SmsSender;
use async_trait::async_trait;
use revloop_core::config::ChannelConfig;
use revloop_core::traits::Outbound;
use revloop_core::types::{ChannelKind, DeliveryError, OutgoingMessage};

/// Routes outgoing messages to the configured transport per channel.
pub struct Delivery {
    email: Option<EmailSender>,
    sms: Option<SmsSender>,
}

impl Delivery {
    /// Build from config. A transport that is absent or disabled simply
    /// isn't routable; sends to it fail permanently with a clear reason.
    pub fn from_config(config: &ChannelConfig) -> Self {
        let email = config
            .email
            .as_ref()
            .filter(|c| c.enabled)
            .and_then(|c| match EmailSender::new(c.clone()) {
                Ok(sender) => Some(sender),
                Err(e) => {
                    tracing::error!("Email transport disabled: {e}");
                    None
                }
            });
        let sms = config
            .sms
            .as_ref()
            .filter(|c| c.enabled)
            .map(|c| SmsSender::new(c.clone()));

        if email.is_none() && sms.is_none() {
            tracing::warn!("⚠️ No delivery transports configured — all sends will fail");
        }
        Self { email, sms }
    }

    /// No transports at all; useful for dry-run setups and tests.
    pub fn unconfigured() -> Self {
        Self {
            email: None,
            sms: None,
        }
    }
}

#[async_trait]
impl Outbound for Delivery {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), DeliveryError> {
        match message.channel {
            ChannelKind::Email => {
                let sender = self.email.as_ref().ok_or_else(|| {
                    DeliveryError::Permanent("email channel not configured".into())
                })?;
                let subject = message.subject.as_deref().unwrap_or("(no subject)");
                sender.send_email(&message.to, subject, &message.body).await
            }
            ChannelKind::Sms => {
                let sender = self.sms.as_ref().ok_or_else(|| {
                    DeliveryError::Permanent("sms channel not configured".into())
                })?;
                sender.send_sms(&message.to, &message.body).await
            }
        }
    }
}
