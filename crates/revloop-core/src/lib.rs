//! # Revloop Core
//!
//! Shared foundation for the Revloop automation engine: configuration,
//! the error taxonomy, the canonical event vocabulary, and the types that
//! cross crate boundaries (channels, statuses, outbound delivery).
//!
//! ## Architecture
//! ```text
//! webhook / API call
//!   → events::normalize         (provider name → canonical event type)
//!   → sequence matching          (revloop-engine)
//!   → enrollment + scheduling    (revloop-engine, state in revloop-db)
//!   → polling executor           (revloop-engine)
//!   → traits::Outbound           (implemented by revloop-channels)
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use config::RevloopConfig;
pub use error::{Result, RevloopError};
pub use traits::Outbound;
pub use types::{
    ChannelKind, DeliveryError, EnrollmentStatus, JobStatus, OutgoingMessage, SequenceStatus,
    StepKind, TriggerSource,
};
