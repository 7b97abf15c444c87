//! Error types for the credit ledger.

use thiserror::Error;

use crate::types::{BalanceId, GrantId};

/// Errors that can occur during ledger operations.
///
/// Definitive business answers (insufficient funds, duplicate purchase,
/// nothing left to refund) are not errors; they are modelled as outcome
/// variants so callers branch on a closed set instead of matching on
/// store-specific failure text.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The referenced balance does not exist
    #[error("Balance not found: {0}")]
    BalanceNotFound(BalanceId),

    /// No grant matches the given purchase reference
    #[error("Grant not found: {0}")]
    GrantNotFound(String),

    /// Operation called with a non-positive or otherwise unusable amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Transfer preconditions failed; neither balance was changed
    #[error("Transfer validation failed: {0}")]
    TransferValidation(String),

    /// Two consumers mutated the same lot outside the store's serialization.
    /// This is an internal-consistency fault, not a retryable condition.
    #[error("Concurrent mutation detected on grant {0}")]
    GrantRace(GrantId),

    /// Backing store failure unrelated to any business rule
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
