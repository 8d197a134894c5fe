//! Error types for the donation domain layer.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`LedgerError`] - Ledger RPC / block explorer errors
//! - [`StoreError`] - Content store errors
//! - [`ValidationError`] - Rejected user input or malformed stored records
//! - [`FinalityError`] - Transfer did not reach successful finality
//! - [`PublicationError`] - Funds moved but the message was not saved
//! - [`DonationError`] - Top-level error for one donation attempt
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use alloy_primitives::{B256, U256};
use thiserror::Error;

// =============================================================================
// Ledger Errors
// =============================================================================

/// Ledger connectivity and decoding errors.
///
/// These errors occur when talking to the chain node or to the block
/// explorer used for historical scans.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Transient network or provider failure (including rate limiting).
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// Operation did not complete within its deadline.
    #[error("Ledger timeout: {0}")]
    Timeout(String),

    /// Response could not be decoded.
    #[error("Ledger decoding error: {0}")]
    Decode(String),

    /// The node or wallet refused the request.
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    /// Event name has no known signature.
    #[error("Unknown contract event: {0}")]
    UnknownEvent(String),
}

impl LedgerError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

// =============================================================================
// Store Errors
// =============================================================================

/// Content store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store or gateway could not be reached, or answered with a server error.
    #[error("Content store unavailable: {0}")]
    Unavailable(String),

    /// Requested object does not exist.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

// =============================================================================
// Validation Errors
// =============================================================================

/// Local validation failures.
///
/// Raised before any ledger call for user input, or while aggregating
/// for a single malformed record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Name must not be empty")]
    EmptyName,

    #[error("Message must be at least {min} characters (got {len})")]
    MessageTooShort { len: usize, min: usize },

    #[error("Donation amount must be greater than 0")]
    ZeroAmount,

    #[error("Insufficient balance: donating {requested} wei but only {available} wei available")]
    InsufficientBalance { requested: U256, available: U256 },

    #[error("Malformed donation record {key}: {reason}")]
    MalformedRecord { key: String, reason: String },
}

// =============================================================================
// Finality & Publication Errors
// =============================================================================

/// The submitted transfer did not reach successful finality.
///
/// Surfaced to the user verbatim, never retried.
#[derive(Debug, Error)]
pub enum FinalityError {
    #[error("Transaction {0} reverted")]
    Reverted(B256),

    /// Finality could not be established (dropped, timed out, ledger down).
    #[error("Transaction {tx} could not be confirmed: {reason}")]
    Unconfirmed { tx: B256, reason: String },
}

/// The transfer succeeded but the message could not be saved.
///
/// Never conflated with a transfer failure: the funds have moved.
#[derive(Debug, Error)]
#[error("Funds sent in {tx}, but the message could not be saved ({key}): {source}")]
pub struct PublicationError {
    /// Transaction that moved the funds.
    pub tx: B256,
    /// Content key the record was meant to be stored under.
    pub key: String,
    #[source]
    pub source: StoreError,
}

// =============================================================================
// Donation Errors
// =============================================================================

/// Top-level error for a donation attempt.
#[derive(Debug, Error)]
pub enum DonationError {
    #[error("Invalid donation: {0}")]
    Validation(#[from] ValidationError),

    /// Submission failed: no funds moved.
    #[error("Submission failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transfer failed: {0}")]
    Finality(#[from] FinalityError),

    #[error(transparent)]
    Publication(#[from] PublicationError),

    /// A previous attempt in this flow has not reached a terminal state.
    #[error("A donation is already in progress")]
    AttemptInProgress,
}

impl DonationError {
    /// Whether the donor's funds left their account.
    pub fn funds_moved(&self) -> bool {
        matches!(self, Self::Publication(_))
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Result type for content store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for donation attempts.
pub type DonationResult<T> = Result<T, DonationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_chain() {
        let ledger_err = LedgerError::Unavailable("rpc down".into());
        let donation_err: DonationError = ledger_err.into();
        assert!(donation_err.to_string().contains("rpc down"));
        assert!(!donation_err.funds_moved());

        let validation: DonationError = ValidationError::ZeroAmount.into();
        assert!(matches!(validation, DonationError::Validation(_)));
    }

    // A publication failure must say the funds moved, and carry the store cause
    #[test]
    fn test_publication_error_reports_funds_moved() {
        let err: DonationError = PublicationError {
            tx: B256::repeat_byte(0xab),
            key: "donation-alice-1".into(),
            source: StoreError::Unavailable("gateway 503".into()),
        }
        .into();

        assert!(err.funds_moved());
        let msg = err.to_string();
        assert!(msg.contains("Funds sent") && msg.contains("donation-alice-1"));
        assert!(msg.contains("gateway 503"));
    }

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(LedgerError::Timeout("t".into()).is_transient());
        assert!(!LedgerError::Rejected("nope".into()).is_transient());
        assert!(StoreError::Unavailable("x".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }
}
