//! Error taxonomy for the moderation core.
//!
//! Authoritative-store failures (`Store`, `Codec`) are fatal for the operation —
//! there is no safe degraded mode for losing the source of truth. Cache and
//! notification failures never appear here: they are swallowed (and logged) at
//! the boundary of the core. A lock denial is likewise not an error; the gate
//! returns [`crate::Decision::Deny`] as a first-class result.

use thiserror::Error;

/// Errors surfaced by the public moderation operations.
#[derive(Debug, Error)]
pub enum ModerationError {
    /// A referenced account / warning / lock / appeal does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Caller-supplied parameter out of contract. No side effects were performed.
    #[error("validation: {0}")]
    Validation(String),

    /// Appeal submissions exceeded the trailing-window threshold.
    #[error("too many appeals, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The authoritative document store failed.
    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    /// A stored document could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ModerationError {
    /// True for errors the caller caused (bad input, missing target) as opposed
    /// to infrastructure failures.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Validation(_) | Self::RateLimited { .. }
        )
    }
}
