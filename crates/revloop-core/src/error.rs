//! Revloop error taxonomy.

use thiserror::Error;

/// Convenience alias used across all Revloop crates.
pub type Result<T> = std::result::Result<T, RevloopError>;

/// All error variants the engine can surface.
///
/// Delivery failures are deliberately NOT here — they carry their own
/// transient/permanent classification ([`crate::types::DeliveryError`])
/// because the executor treats the two classes differently.
#[derive(Debug, Error)]
pub enum RevloopError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Db(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Sequence has no steps configured: {0}")]
    NoStepsConfigured(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RevloopError {
    /// Shorthand constructors — keep call sites terse.
    pub fn db(msg: impl Into<String>) -> Self {
        Self::Db(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Duplicate(msg.into())
    }
}
