//! Capability traits implemented outside the engine core.

use crate::types::{DeliveryError, OutgoingMessage};
use async_trait::async_trait;

/// The opaque "send" capability.
///
/// The engine renders messages and decides *whether* to send; transports
/// (SMTP, SMS gateways) decide *how*. Implementations must apply their own
/// bounded timeout — a hung send must not stall an executor batch.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), DeliveryError>;
}
