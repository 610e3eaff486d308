//! Error types for compute-broker.

use crate::chain::ChainError;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in compute-broker.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required precondition does not hold (never retried).
    ///
    /// Examples: provider signer not acknowledged, deliverable not yet
    /// acknowledged, missing secret, malformed record length.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The nonce lock could not be acquired within the retry budget.
    #[error("nonce allocator busy: {0}")]
    Busy(String),

    /// An on-chain transaction failed terminally.
    ///
    /// Carries a human-readable message, decoded from the contract's custom
    /// error when the revert reason is known.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// Gas-price escalation reached its ceiling without confirmation.
    #[error("gas price cap reached at {gas_price} after {attempts} attempts: {last_error}")]
    GasCapReached {
        /// Gas price of the last attempt.
        gas_price: u128,
        /// Number of submission attempts made.
        attempts: u32,
        /// The last retryable failure observed.
        last_error: String,
    },

    /// Chain RPC error that was not a transaction outcome (reads, estimates).
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// A trust check failed: signature mismatch, tag-chain mismatch or
    /// attestation rejection.
    #[error("verification failed: {0}")]
    Verification(String),

    /// Cryptographic error (malformed keys, AEAD failure).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Provider endpoint error (unreachable, bad status, malformed body).
    #[error("provider error: {0}")]
    Provider(String),

    /// Cache backend error.
    #[error("cache error: {0}")]
    Cache(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true if this error is a precondition failure.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }

    /// Returns true if this error is a trust/verification failure.
    #[must_use]
    pub fn is_verification(&self) -> bool {
        matches!(self, Self::Verification(_))
    }
}
