//! Common identifier types used throughout the credit ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A timestamp used for timing events in the ledger
pub type Timestamp = DateTime<Utc>;

/// Balance identifier
pub type BalanceId = String;

/// Grant (lot) identifier
pub type GrantId = String;

/// Transaction identifier
pub type TransactionId = String;

/// Generate a fresh identifier for a ledger row
pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// The key identifying a balance owner, e.g. "session:xyz123" for an
/// anonymous browser session or "account:42" for an authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerKey {
    /// The owner key string
    value: String,
}

impl OwnerKey {
    /// Create a new owner key with the given value
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Get the owner key as a string
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_key() {
        let key = OwnerKey::new("session:abc123");
        assert_eq!(key.as_str(), "session:abc123");
        assert_eq!(key.to_string(), "session:abc123");

        let key2 = OwnerKey::new("session:abc123");
        assert_eq!(key, key2);

        let key3 = OwnerKey::new("account:42");
        assert_ne!(key, key3);
    }

    #[test]
    fn test_new_id_is_unique() {
        assert_ne!(new_id(), new_id());
    }
}
