//! Transaction model.
//!
//! Transactions are the append-only audit record of every balance-affecting
//! event. They are created exactly once per mutating operation and never
//! mutated or deleted; the signed sum of a balance's transactions equals its
//! current credits.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LedgerError, LedgerResult};
use crate::types::{new_id, BalanceId, GrantId, Timestamp, TransactionId};

/// The kind of balance-affecting event a transaction records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Credits added by a purchase or award
    Purchase,
    /// Credits consumed by chargeable work
    Usage,
    /// Credits moved between owners (session claim)
    Transfer,
    /// Unconsumed purchase credits returned
    Refund,
}

impl TransactionKind {
    /// Stable string form used by the persistent store
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Purchase => "purchase",
            TransactionKind::Usage => "usage",
            TransactionKind::Transfer => "transfer",
            TransactionKind::Refund => "refund",
        }
    }

    /// Parse the stable string form back into a kind
    pub fn parse(value: &str) -> LedgerResult<Self> {
        match value {
            "purchase" => Ok(TransactionKind::Purchase),
            "usage" => Ok(TransactionKind::Usage),
            "transfer" => Ok(TransactionKind::Transfer),
            "refund" => Ok(TransactionKind::Refund),
            other => Err(LedgerError::Storage(format!(
                "Unknown transaction kind: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single entry in the transaction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID
    pub id: TransactionId,

    /// The balance this entry belongs to
    pub balance_id: BalanceId,

    /// The grant this entry drew from or created, when grant tracking is on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<GrantId>,

    /// What kind of event this records
    pub kind: TransactionKind,

    /// Signed credit delta; positive for purchase, negative for usage and
    /// refund, either sign for transfer legs
    pub amount: i64,

    /// Human-readable description
    pub description: String,

    /// Type of file the chargeable work ran against, for usage entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,

    /// Caller-supplied deduplication token, e.g. a payment id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<String>,

    /// Creation time
    pub created_at: Timestamp,
}

impl Transaction {
    /// Create a new transaction entry
    pub fn new(
        balance_id: BalanceId,
        grant_id: Option<GrantId>,
        kind: TransactionKind,
        amount: i64,
        description: String,
        file_type: Option<String>,
        source_reference: Option<String>,
    ) -> Self {
        Self {
            id: new_id(),
            balance_id,
            grant_id,
            kind,
            amount,
            description,
            file_type,
            source_reference,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_form() {
        for kind in [
            TransactionKind::Purchase,
            TransactionKind::Usage,
            TransactionKind::Transfer,
            TransactionKind::Refund,
        ] {
            assert_eq!(TransactionKind::parse(kind.as_str()).unwrap(), kind);
        }

        assert!(TransactionKind::parse("chargeback").is_err());
    }
}
