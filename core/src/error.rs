// Error taxonomy for the mixing engine
//
// Input and policy failures are surfaced verbatim and never retried.
// Capacity failures may be retried by the caller after backoff.
// Collaborator failures and timeouts are the only retryable class.

use crate::model::{Amount, Currency};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MixerError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MixerError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("security check rejected request: {0}")]
    Security(String),
    #[error("pool overflow for {currency}: {total} + {amount} exceeds maximum {max}")]
    PoolOverflow {
        currency: Currency,
        total: Amount,
        amount: Amount,
        max: Amount,
    },
    #[error("insufficient funds in {currency} pool: requested {requested}, eligible {available}")]
    InsufficientFunds {
        currency: Currency,
        requested: Amount,
        available: Amount,
    },
    #[error("scheduling error: {0}")]
    Scheduling(String),
    #[error("{collaborator} failure: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },
    #[error("{0} timed out")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("maximum concurrent mixes reached")]
    ConcurrencyLimit,
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },
}

impl MixerError {
    pub fn collaborator(collaborator: &'static str, err: impl std::fmt::Display) -> Self {
        MixerError::Collaborator {
            collaborator,
            message: err.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        MixerError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        MixerError::InvalidState {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Only collaborator failures and timeouts are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MixerError::Collaborator { .. } | MixerError::Timeout(_))
    }

    /// Capacity errors clear on their own once the pool moves.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            MixerError::PoolOverflow { .. } | MixerError::InsufficientFunds { .. }
        )
    }
}
