//! Balance model.
//!
//! A balance is the current usable credit count for one owner key. It is
//! created on first reference to the owner and never deleted.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{new_id, BalanceId, OwnerKey, Timestamp};

/// A credit balance in the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    /// Balance ID
    pub id: BalanceId,

    /// The owner this balance belongs to
    pub owner_key: OwnerKey,

    /// Current usable credits; never negative
    pub credits: i64,

    /// Creation time
    pub created_at: Timestamp,

    /// Last update time
    pub updated_at: Timestamp,
}

impl Balance {
    /// Create a new zero-credit balance for an owner
    pub fn new(owner_key: OwnerKey) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            owner_key,
            credits: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether a debit of `amount` is covered by the current credits
    pub fn can_debit(&self, amount: i64) -> bool {
        self.credits >= amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_balance_starts_empty() {
        let balance = Balance::new(OwnerKey::new("session:a"));
        assert_eq!(balance.credits, 0);
        assert_eq!(balance.owner_key.as_str(), "session:a");
        assert_eq!(balance.created_at, balance.updated_at);
    }

    #[test]
    fn test_can_debit() {
        let mut balance = Balance::new(OwnerKey::new("session:a"));
        balance.credits = 10;

        assert!(balance.can_debit(10));
        assert!(balance.can_debit(1));
        assert!(!balance.can_debit(11));
    }
}
