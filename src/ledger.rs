//! Credit ledger service.
//!
//! This module provides the public operation surface: argument validation,
//! structured logging, and delegation to the injected [`LedgerStore`],
//! which owns all atomicity. External collaborators (the payment notifier,
//! the chargeable-work engine, and the account claim flow) call these
//! methods and branch on the returned outcomes.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::balance::Balance;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::grant::Grant;
use crate::store::{
    CreditOutcome, DebitOutcome, LedgerStore, RefundOutcome, TransferReceipt,
};
use crate::transaction::Transaction;
use crate::types::{OwnerKey, Timestamp};

/// The prepaid credit ledger
pub struct CreditLedger {
    /// Backing store; all mutations run through its atomic primitives
    store: Arc<dyn LedgerStore>,
    /// Configuration resolved at startup
    config: LedgerConfig,
}

impl CreditLedger {
    /// Create a ledger over the given store
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Resolve an owner key to its balance, creating it on first touch
    pub async fn get_or_create_balance(&self, owner_key: &OwnerKey) -> LedgerResult<Balance> {
        self.store.get_or_create_balance(owner_key).await
    }

    /// Get a balance by id
    pub async fn balance(&self, balance_id: &str) -> LedgerResult<Balance> {
        self.store
            .balance(balance_id)
            .await?
            .ok_or_else(|| LedgerError::BalanceNotFound(balance_id.to_string()))
    }

    /// Get a balance by owner key
    pub async fn balance_by_owner(&self, owner_key: &OwnerKey) -> LedgerResult<Balance> {
        self.store
            .balance_by_owner(owner_key)
            .await?
            .ok_or_else(|| LedgerError::BalanceNotFound(owner_key.as_str().to_string()))
    }

    /// Record a purchase: add credits, create the backing grant, and append
    /// a purchase transaction, all atomically.
    ///
    /// Payment notifications are delivered at least once; passing the
    /// payment id as `source_reference` makes redelivery return the original
    /// transaction instead of crediting twice.
    pub async fn credit(
        &self,
        balance_id: &str,
        amount: i64,
        description: &str,
        source_reference: Option<&str>,
    ) -> LedgerResult<CreditOutcome> {
        ensure_positive(amount, "credit")?;

        let outcome = self
            .store
            .credit(balance_id, amount, description, source_reference, None)
            .await?;

        if !outcome.is_duplicate() {
            info!(
                balance_id = %balance_id,
                amount,
                source_reference = source_reference.unwrap_or("-"),
                "Recorded purchase credit"
            );
        }
        Ok(outcome)
    }

    /// Grant promotional or goodwill credits, optionally expiring.
    ///
    /// Same atomic unit as [`credit`](Self::credit) but with no payment to
    /// deduplicate against.
    pub async fn award(
        &self,
        balance_id: &str,
        amount: i64,
        description: &str,
        expires_at: Option<Timestamp>,
    ) -> LedgerResult<CreditOutcome> {
        ensure_positive(amount, "award")?;

        let outcome = self
            .store
            .credit(balance_id, amount, description, None, expires_at)
            .await?;

        info!(balance_id = %balance_id, amount, "Recorded credit award");
        Ok(outcome)
    }

    /// Charge credits for billable work.
    ///
    /// Returns [`DebitOutcome::InsufficientFunds`], a definitive answer
    /// rather than a retryable error, when the balance cannot cover the amount;
    /// callers must not perform the work in that case.
    pub async fn debit(
        &self,
        balance_id: &str,
        amount: i64,
        description: &str,
        file_type: Option<&str>,
    ) -> LedgerResult<DebitOutcome> {
        ensure_positive(amount, "debit")?;

        let outcome = self
            .store
            .debit(balance_id, amount, description, file_type)
            .await?;

        match &outcome {
            DebitOutcome::Completed(receipt) => {
                debug!(
                    balance_id = %balance_id,
                    amount,
                    remaining = receipt.balance.credits,
                    lots = receipt.transactions.len(),
                    "Debited credits"
                );
            }
            DebitOutcome::InsufficientFunds {
                available,
                requested,
            } => {
                debug!(
                    balance_id = %balance_id,
                    available,
                    requested,
                    "Debit refused, insufficient credits"
                );
            }
        }
        Ok(outcome)
    }

    /// Move credits and their unconsumed lots to another owner.
    ///
    /// Called exactly once when an anonymous session is claimed by an
    /// account; the lots keep their original `created_at`, so this is an
    /// ownership change rather than a new purchase.
    pub async fn transfer(
        &self,
        from_balance_id: &str,
        to_balance_id: &str,
        amount: i64,
        description: &str,
    ) -> LedgerResult<TransferReceipt> {
        ensure_positive(amount, "transfer")?;
        if from_balance_id == to_balance_id {
            return Err(LedgerError::TransferValidation(
                "Source and destination are the same balance".to_string(),
            ));
        }

        self.store
            .transfer(from_balance_id, to_balance_id, amount, description)
            .await
    }

    /// Return the unconsumed remainder of a purchase.
    ///
    /// `source_reference` is the payment id originally passed to
    /// [`credit`](Self::credit). Consumed credits stay consumed; only what
    /// is left on the lot comes back.
    pub async fn refund_purchase(
        &self,
        balance_id: &str,
        source_reference: &str,
        description: &str,
    ) -> LedgerResult<RefundOutcome> {
        let outcome = self
            .store
            .refund_purchase(balance_id, source_reference, description)
            .await?;

        if matches!(outcome, RefundOutcome::NothingToRefund) {
            warn!(
                balance_id = %balance_id,
                source_reference = %source_reference,
                "Refund requested but grant is spent or expired"
            );
        }
        Ok(outcome)
    }

    /// List a balance's transactions, newest first
    pub async fn history(
        &self,
        balance_id: &str,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<Transaction>> {
        let limit = limit.unwrap_or(self.config.default_history_limit);
        self.store.transactions(balance_id, limit).await
    }

    /// List a balance's grants in consumption order
    pub async fn grants(&self, balance_id: &str) -> LedgerResult<Vec<Grant>> {
        self.store.grants(balance_id).await
    }
}

fn ensure_positive(amount: i64, operation: &str) -> LedgerResult<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(format!(
            "{} amount must be positive, got {}",
            operation, amount
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio_test::block_on;

    fn test_ledger() -> CreditLedger {
        let store = Arc::new(MemoryStore::new(LedgerConfig::default()));
        CreditLedger::new(store, LedgerConfig::default())
    }

    #[test]
    fn test_rejects_non_positive_amounts() {
        block_on(async {
            let ledger = test_ledger();
            let balance = ledger
                .get_or_create_balance(&OwnerKey::new("session:a"))
                .await
                .unwrap();

            for amount in [0, -5] {
                assert!(matches!(
                    ledger.credit(&balance.id, amount, "Purchase", None).await,
                    Err(LedgerError::InvalidAmount(_))
                ));
                assert!(matches!(
                    ledger.debit(&balance.id, amount, "Extraction", None).await,
                    Err(LedgerError::InvalidAmount(_))
                ));
            }
        });
    }

    #[test]
    fn test_rejects_self_transfer() {
        block_on(async {
            let ledger = test_ledger();
            let balance = ledger
                .get_or_create_balance(&OwnerKey::new("session:a"))
                .await
                .unwrap();

            assert!(matches!(
                ledger.transfer(&balance.id, &balance.id, 1, "Claim").await,
                Err(LedgerError::TransferValidation(_))
            ));
        });
    }

    #[test]
    fn test_balance_lookup_not_found() {
        block_on(async {
            let ledger = test_ledger();
            assert!(matches!(
                ledger.balance("missing").await,
                Err(LedgerError::BalanceNotFound(_))
            ));
            assert!(matches!(
                ledger.balance_by_owner(&OwnerKey::new("nobody")).await,
                Err(LedgerError::BalanceNotFound(_))
            ));
        });
    }
}
