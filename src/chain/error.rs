//! Typed outcomes of chain RPC calls.

use std::fmt;
use thiserror::Error;

/// Transient failure kinds that are worth resubmitting with a higher gas price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryableKind {
    /// Gas price below the node's minimum.
    Underpriced,
    /// A pending transaction with the same nonce pays more.
    ReplacementUnderpriced,
    /// Fee cap below the current base fee.
    FeeTooLow,
    /// The node's mempool refused the transaction.
    MempoolFull,
    /// The transaction nonce was already used.
    StaleNonce,
}

impl fmt::Display for RetryableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Underpriced => "transaction underpriced",
            Self::ReplacementUnderpriced => "replacement transaction underpriced",
            Self::FeeTooLow => "fee too low",
            Self::MempoolFull => "mempool full",
            Self::StaleNonce => "nonce too low",
        };
        f.write_str(text)
    }
}

impl RetryableKind {
    /// Map a node error message onto a retryable kind.
    ///
    /// Upstream wording is not contractually stable; adapters should prefer
    /// structured error codes and only fall back to this substring list.
    #[must_use]
    pub fn classify(message: &str) -> Option<Self> {
        let message = message.to_ascii_lowercase();
        if message.contains("replacement transaction underpriced")
            || message.contains("replacement fee too low")
        {
            Some(Self::ReplacementUnderpriced)
        } else if message.contains("transaction underpriced") || message.contains("underpriced") {
            Some(Self::Underpriced)
        } else if message.contains("fee too low")
            || message.contains("max fee per gas less than block base fee")
        {
            Some(Self::FeeTooLow)
        } else if message.contains("mempool is full")
            || message.contains("txpool is full")
            || message.contains("transaction pool is full")
        {
            Some(Self::MempoolFull)
        } else if message.contains("nonce too low")
            || message.contains("nonce has already been used")
        {
            Some(Self::StaleNonce)
        } else {
            None
        }
    }
}

/// Errors produced by a [`LedgerChain`](super::LedgerChain) adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Transient failure; the same action may be resubmitted.
    #[error("{kind}: {message}")]
    Retryable {
        /// Classified failure kind.
        kind: RetryableKind,
        /// Raw node message.
        message: String,
    },

    /// The contract reverted with a custom error.
    #[error("execution reverted: {name}({})", args.join(", "))]
    Reverted {
        /// Custom error name.
        name: String,
        /// Decoded error arguments, rendered as strings.
        args: Vec<String>,
    },

    /// The transaction was not confirmed within the timeout.
    #[error("transaction {0} not confirmed in time")]
    Timeout(String),

    /// Any other RPC failure.
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl ChainError {
    /// Build an error from a raw node message, classifying retryable ones.
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match RetryableKind::classify(&message) {
            Some(kind) => Self::Retryable { kind, message },
            None => Self::Rpc(message),
        }
    }

    /// Build a custom-error revert.
    #[must_use]
    pub fn reverted(name: &str, args: &[impl ToString]) -> Self {
        Self::Reverted {
            name: name.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }

    /// The retryable kind, if this error is transient.
    #[must_use]
    pub fn retryable_kind(&self) -> Option<RetryableKind> {
        match self {
            Self::Retryable { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
