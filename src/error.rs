//! Error kinds surfaced by the venue core.
//!
//! Validation and business errors propagate back to the command caller and
//! never disturb engine state. `InvariantViolation` is engine-fatal: the
//! symbol worker that hits one logs at error level with full context and
//! halts until manual intervention.

use thiserror::Error;

use crate::core_types::AssetId;

/// Errors returned by venue commands and store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Bad input, surfaced to the caller.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Pre-match balance lock failed.
    #[error("insufficient funds: asset {asset} requires {required}, free {free}")]
    InsufficientFunds {
        asset: AssetId,
        required: u64,
        free: u64,
    },

    /// Cancel applied to a terminal or foreign order.
    #[error("order not cancellable")]
    NotCancellable,

    #[error("not found")]
    NotFound,

    /// Per-symbol command queue is full (or the worker is gone).
    #[error("engine busy")]
    Busy,

    /// The command was not answered within the configured deadline.
    #[error("timed out")]
    TimedOut,

    /// Subscriber outbound queue overflowed; the client was disconnected.
    #[error("slow consumer")]
    SlowConsumer,

    /// Asset accounting broke. Fatal for the symbol worker that observed it.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// True for errors that must halt the observing symbol worker.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}
