//! # Revloop Channels
//! Delivery transport implementations behind the core `Outbound` trait.

pub mod email;
pub mod outbound;
pub mod sms;

pub use email::EmailSender;
pub use outbound::Delivery;
pub use sms::SmsSender;
