//! Email transport — async SMTP sending via lettre.
//!
//! Outbound only; supports Gmail, Outlook, and custom relays over STARTTLS.

use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor,
    message::Mailbox, message::header::ContentType,
    transport::smtp::authentication::Credentials,
};
use revloop_core::config::EmailChannelConfig;
use revloop_core::types::DeliveryError;

/// SMTP email sender.
pub struct EmailSender {
    config: EmailChannelConfig,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailSender {
    /// Build the transport once; reused for every send.
    pub fn new(config: EmailChannelConfig) -> Result<Self, DeliveryError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| DeliveryError::Permanent(format!("SMTP relay: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();
        Ok(Self { config, mailer })
    }

    /// Send one email.
    pub async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), DeliveryError> {
        let from_name = self.config.from_name.as_deref().unwrap_or("Reviews");
        let from_mailbox: Mailbox = format!("{from_name} <{}>", self.config.from_address)
            .parse()
            .map_err(|e| DeliveryError::Permanent(format!("Invalid from: {e}")))?;
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| DeliveryError::Permanent(format!("Invalid to '{to}': {e}")))?;

        let email = LettreMessage::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DeliveryError::Permanent(format!("Build email: {e}")))?;

        self.mailer.send(email).await.map_err(|e| {
            // lettre classifies SMTP response codes; everything else
            // (connection, TLS, timeout) is worth a retry.
            if e.is_permanent() {
                DeliveryError::Permanent(format!("SMTP send: {e}"))
            } else {
                DeliveryError::Transient(format!("SMTP send: {e}"))
            }
        })?;

        tracing::info!("📤 Email sent to {to}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmailChannelConfig {
        EmailChannelConfig {
            enabled: true,
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            from_address: "reviews@example.com".into(),
            from_name: Some("Ace Plumbing".into()),
            username: "reviews@example.com".into(),
            password: "pw".into(),
        }
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let sender = EmailSender::new(config()).unwrap();
        let err = sender
            .send_email("not an address", "subject", "body")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Permanent(_)));
    }
}
