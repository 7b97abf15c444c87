//! In-memory ledger store.
//!
//! Used by tests and single-process deployments. Atomicity contracts are
//! satisfied with one async mutex per balance: every mutation of a balance,
//! its grants, and its transaction log happens under that balance's mutex,
//! and two-balance operations lock both cells in balance-id order. An outer
//! `RwLock` index serializes first-touch creation per owner key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::balance::Balance;
use crate::config::{GrantTracking, LedgerConfig};
use crate::error::{LedgerError, LedgerResult};
use crate::grant::{plan_consumption, Grant, GrantDraw};
use crate::store::{
    CreditOutcome, DebitOutcome, DebitReceipt, LedgerStore, RefundOutcome, TransferReceipt,
};
use crate::transaction::{Transaction, TransactionKind};
use crate::types::{BalanceId, OwnerKey, Timestamp};

/// Everything owned by one balance, guarded by one mutex
struct BalanceCell {
    balance: Balance,
    grants: Vec<Grant>,
    transactions: Vec<Transaction>,
}

#[derive(Default)]
struct MemoryIndex {
    by_owner: HashMap<String, BalanceId>,
    cells: HashMap<BalanceId, Arc<Mutex<BalanceCell>>>,
}

/// In-memory implementation of [`LedgerStore`]
pub struct MemoryStore {
    config: LedgerConfig,
    index: RwLock<MemoryIndex>,
}

impl MemoryStore {
    /// Create an empty in-memory store
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            index: RwLock::new(MemoryIndex::default()),
        }
    }

    fn grant_tracking(&self) -> bool {
        self.config.grant_tracking == GrantTracking::Enabled
    }

    async fn cell(&self, balance_id: &str) -> LedgerResult<Arc<Mutex<BalanceCell>>> {
        let index = self.index.read().await;
        index
            .cells
            .get(balance_id)
            .cloned()
            .ok_or_else(|| LedgerError::BalanceNotFound(balance_id.to_string()))
    }

    /// Stage FIFO consumption against a copy of the balance's grants.
    ///
    /// Returns the mutated grant list and the usage transactions to append,
    /// so the caller commits everything at once or nothing at all.
    fn stage_consumption(
        &self,
        cell: &BalanceCell,
        balance_id: &str,
        amount: i64,
        description: &str,
        file_type: Option<&str>,
        now: Timestamp,
    ) -> LedgerResult<(Vec<Grant>, Vec<Transaction>)> {
        let mut grants = cell.grants.clone();
        let plan = plan_consumption(&grants, amount, now);

        let mut draws = plan.draws;
        if plan.shortfall > 0 {
            // Credits issued before lot tracking; backfill a legacy lot so
            // consumption always has lots to draw from.
            let legacy = Grant::legacy(
                balance_id.to_string(),
                plan.shortfall,
                self.config.legacy_grant_description.clone(),
            );
            debug!(
                balance_id = %balance_id,
                shortfall = plan.shortfall,
                "Synthesized legacy lot for untracked credits"
            );
            draws.insert(
                0,
                GrantDraw {
                    grant_id: legacy.id.clone(),
                    amount: plan.shortfall,
                },
            );
            grants.push(legacy);
        }

        let mut transactions = Vec::with_capacity(draws.len());
        for draw in draws {
            let grant = grants
                .iter_mut()
                .find(|grant| grant.id == draw.grant_id)
                .ok_or_else(|| {
                    LedgerError::Storage(format!("Planned grant {} disappeared", draw.grant_id))
                })?;

            // Guarded decrement of the lot. Under the per-balance mutex this
            // cannot lose a race, but the contract is checked all the same.
            if grant.remaining < draw.amount {
                error!(
                    grant_id = %draw.grant_id,
                    remaining = grant.remaining,
                    take = draw.amount,
                    "Grant consumption race detected"
                );
                return Err(LedgerError::GrantRace(draw.grant_id.clone()));
            }
            grant.remaining -= draw.amount;

            transactions.push(Transaction::new(
                balance_id.to_string(),
                Some(draw.grant_id.clone()),
                TransactionKind::Usage,
                -draw.amount,
                description.to_string(),
                file_type.map(|value| value.to_string()),
                None,
            ));
        }

        Ok((grants, transactions))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_or_create_balance(&self, owner_key: &OwnerKey) -> LedgerResult<Balance> {
        // Fast path: the owner already has a balance
        {
            let index = self.index.read().await;
            if let Some(balance_id) = index.by_owner.get(owner_key.as_str()) {
                let cell = index.cells[balance_id].clone();
                drop(index);
                return Ok(cell.lock().await.balance.clone());
            }
        }

        let mut index = self.index.write().await;

        // Re-check under the write lock; a concurrent first touch may have won
        if let Some(balance_id) = index.by_owner.get(owner_key.as_str()) {
            let cell = index.cells[balance_id].clone();
            drop(index);
            return Ok(cell.lock().await.balance.clone());
        }

        let balance = Balance::new(owner_key.clone());
        info!(balance_id = %balance.id, owner_key = %owner_key, "Created balance");

        index
            .by_owner
            .insert(owner_key.as_str().to_string(), balance.id.clone());
        index.cells.insert(
            balance.id.clone(),
            Arc::new(Mutex::new(BalanceCell {
                balance: balance.clone(),
                grants: Vec::new(),
                transactions: Vec::new(),
            })),
        );

        Ok(balance)
    }

    async fn balance(&self, balance_id: &str) -> LedgerResult<Option<Balance>> {
        let cell = {
            let index = self.index.read().await;
            match index.cells.get(balance_id) {
                Some(cell) => cell.clone(),
                None => return Ok(None),
            }
        };
        let balance = cell.lock().await.balance.clone();
        Ok(Some(balance))
    }

    async fn balance_by_owner(&self, owner_key: &OwnerKey) -> LedgerResult<Option<Balance>> {
        let cell = {
            let index = self.index.read().await;
            match index.by_owner.get(owner_key.as_str()) {
                Some(balance_id) => index.cells[balance_id].clone(),
                None => return Ok(None),
            }
        };
        let balance = cell.lock().await.balance.clone();
        Ok(Some(balance))
    }

    async fn credit(
        &self,
        balance_id: &str,
        amount: i64,
        description: &str,
        source_reference: Option<&str>,
        expires_at: Option<Timestamp>,
    ) -> LedgerResult<CreditOutcome> {
        let cell = self.cell(balance_id).await?;
        let mut cell = cell.lock().await;

        // Absorb at-least-once delivery of purchase notifications
        if let Some(reference) = source_reference {
            if let Some(existing) = cell.transactions.iter().find(|tx| {
                tx.kind == TransactionKind::Purchase
                    && tx.source_reference.as_deref() == Some(reference)
            }) {
                debug!(
                    balance_id = %balance_id,
                    source_reference = %reference,
                    "Duplicate purchase delivery absorbed"
                );
                return Ok(CreditOutcome::Duplicate {
                    transaction: existing.clone(),
                });
            }
        }

        let grant = if self.grant_tracking() {
            Some(Grant::new(
                balance_id.to_string(),
                amount,
                description.to_string(),
                source_reference.map(|value| value.to_string()),
                expires_at,
            ))
        } else {
            None
        };

        let transaction = Transaction::new(
            balance_id.to_string(),
            grant.as_ref().map(|grant| grant.id.clone()),
            TransactionKind::Purchase,
            amount,
            description.to_string(),
            None,
            source_reference.map(|value| value.to_string()),
        );

        cell.balance.credits += amount;
        cell.balance.updated_at = Utc::now();
        if let Some(grant) = &grant {
            cell.grants.push(grant.clone());
        }
        cell.transactions.push(transaction.clone());

        Ok(CreditOutcome::Applied { transaction, grant })
    }

    async fn debit(
        &self,
        balance_id: &str,
        amount: i64,
        description: &str,
        file_type: Option<&str>,
    ) -> LedgerResult<DebitOutcome> {
        let cell = self.cell(balance_id).await?;
        let mut cell = cell.lock().await;

        // The guarded decrement: subtract only if credits cover the amount.
        // A failed guard is a definitive answer with no side effects.
        if !cell.balance.can_debit(amount) {
            return Ok(DebitOutcome::InsufficientFunds {
                available: cell.balance.credits,
                requested: amount,
            });
        }

        let now = Utc::now();
        let (grants, transactions) = if self.grant_tracking() {
            self.stage_consumption(&cell, balance_id, amount, description, file_type, now)?
        } else {
            let transaction = Transaction::new(
                balance_id.to_string(),
                None,
                TransactionKind::Usage,
                -amount,
                description.to_string(),
                file_type.map(|value| value.to_string()),
                None,
            );
            (cell.grants.clone(), vec![transaction])
        };

        // Commit the whole unit
        cell.balance.credits -= amount;
        cell.balance.updated_at = now;
        cell.grants = grants;
        cell.transactions.extend(transactions.iter().cloned());

        Ok(DebitOutcome::Completed(DebitReceipt {
            balance: cell.balance.clone(),
            transactions,
        }))
    }

    async fn transfer(
        &self,
        from_balance_id: &str,
        to_balance_id: &str,
        amount: i64,
        description: &str,
    ) -> LedgerResult<TransferReceipt> {
        if from_balance_id == to_balance_id {
            return Err(LedgerError::TransferValidation(
                "Source and destination are the same balance".to_string(),
            ));
        }

        let from_cell = self.cell(from_balance_id).await.map_err(|_| {
            LedgerError::TransferValidation(format!(
                "Source balance not found: {}",
                from_balance_id
            ))
        })?;
        let to_cell = self.cell(to_balance_id).await.map_err(|_| {
            LedgerError::TransferValidation(format!(
                "Destination balance not found: {}",
                to_balance_id
            ))
        })?;

        // Lock the smaller balance id first to prevent circular wait
        let from_first = from_balance_id < to_balance_id;
        let (first, second) = if from_first {
            (from_cell, to_cell)
        } else {
            (to_cell, from_cell)
        };
        let mut first = first.lock().await;
        let mut second = second.lock().await;
        let (from_state, to_state) = if from_first {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };

        if !from_state.balance.can_debit(amount) {
            return Err(LedgerError::TransferValidation(format!(
                "Source balance {} has {} credits, cannot transfer {}",
                from_balance_id, from_state.balance.credits, amount
            )));
        }

        let now = Utc::now();
        let mut grants_moved = 0;

        if self.grant_tracking() {
            let unconsumed: i64 = from_state
                .grants
                .iter()
                .filter(|grant| grant.is_consumable(now))
                .map(|grant| grant.remaining)
                .sum();
            let shortfall = (amount - unconsumed).max(0);
            if shortfall > 0 {
                from_state.grants.push(Grant::legacy(
                    from_balance_id.to_string(),
                    shortfall,
                    self.config.legacy_grant_description.clone(),
                ));
            }

            // Reassign every unconsumed lot, preserving created_at so the
            // consumption order and purchase history survive the move.
            let mut kept = Vec::new();
            for mut grant in from_state.grants.drain(..) {
                if grant.remaining > 0 {
                    grant.balance_id = to_balance_id.to_string();
                    to_state.grants.push(grant);
                    grants_moved += 1;
                } else {
                    kept.push(grant);
                }
            }
            from_state.grants = kept;
        }

        from_state.balance.credits -= amount;
        from_state.balance.updated_at = now;
        to_state.balance.credits += amount;
        to_state.balance.updated_at = now;

        let outgoing = Transaction::new(
            from_balance_id.to_string(),
            None,
            TransactionKind::Transfer,
            -amount,
            description.to_string(),
            None,
            None,
        );
        let incoming = Transaction::new(
            to_balance_id.to_string(),
            None,
            TransactionKind::Transfer,
            amount,
            description.to_string(),
            None,
            None,
        );
        from_state.transactions.push(outgoing.clone());
        to_state.transactions.push(incoming.clone());

        info!(
            from = %from_balance_id,
            to = %to_balance_id,
            amount,
            grants_moved,
            "Transferred credits"
        );

        Ok(TransferReceipt {
            outgoing,
            incoming,
            grants_moved,
        })
    }

    async fn refund_purchase(
        &self,
        balance_id: &str,
        source_reference: &str,
        description: &str,
    ) -> LedgerResult<RefundOutcome> {
        let cell = self.cell(balance_id).await?;
        let mut cell = cell.lock().await;

        let now = Utc::now();
        let position = cell
            .grants
            .iter()
            .position(|grant| grant.source_reference.as_deref() == Some(source_reference))
            .ok_or_else(|| {
                LedgerError::GrantNotFound(format!(
                    "No grant for purchase reference {} on balance {}",
                    source_reference, balance_id
                ))
            })?;

        let (grant_id, refund_amount) = {
            let grant = &cell.grants[position];
            if grant.is_spent() || grant.is_expired(now) {
                return Ok(RefundOutcome::NothingToRefund);
            }
            (grant.id.clone(), grant.remaining)
        };

        // The balance must cover the unconsumed remainder; anything else
        // means the ledger is internally inconsistent.
        if cell.balance.credits < refund_amount {
            return Err(LedgerError::Storage(format!(
                "Balance {} cannot cover refund of grant {}",
                balance_id, grant_id
            )));
        }

        cell.grants[position].remaining = 0;
        cell.balance.credits -= refund_amount;
        cell.balance.updated_at = now;

        let transaction = Transaction::new(
            balance_id.to_string(),
            Some(grant_id),
            TransactionKind::Refund,
            -refund_amount,
            description.to_string(),
            None,
            Some(source_reference.to_string()),
        );
        cell.transactions.push(transaction.clone());

        info!(
            balance_id = %balance_id,
            source_reference = %source_reference,
            amount = refund_amount,
            "Refunded unconsumed purchase credits"
        );

        Ok(RefundOutcome::Refunded {
            transaction,
            amount: refund_amount,
        })
    }

    async fn transactions(
        &self,
        balance_id: &str,
        limit: usize,
    ) -> LedgerResult<Vec<Transaction>> {
        let cell = self.cell(balance_id).await?;
        let cell = cell.lock().await;

        // The log is append-only, so reverse order is newest first
        Ok(cell
            .transactions
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn grants(&self, balance_id: &str) -> LedgerResult<Vec<Grant>> {
        let cell = self.cell(balance_id).await?;
        let cell = cell.lock().await;

        let mut grants = cell.grants.clone();
        grants.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(grants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use tokio_test::block_on;

    #[test]
    fn test_first_touch_creates_once() {
        block_on(async {
            let store = MemoryStore::new(LedgerConfig::default());
            let owner = OwnerKey::new("session:abc");

            let first = store.get_or_create_balance(&owner).await.unwrap();
            let second = store.get_or_create_balance(&owner).await.unwrap();

            assert_eq!(first.id, second.id);
            assert_eq!(second.credits, 0);
        });
    }

    #[test]
    fn test_debit_backfills_legacy_lot() {
        block_on(async {
            let store = MemoryStore::new(LedgerConfig::default());
            let owner = OwnerKey::new("session:legacy");
            let balance = store.get_or_create_balance(&owner).await.unwrap();

            // Simulate a balance whose credits predate lot tracking
            {
                let cell = store.cell(&balance.id).await.unwrap();
                let mut cell = cell.lock().await;
                cell.balance.credits = 40;
            }

            let outcome = store
                .debit(&balance.id, 25, "Extraction", Some("pdf"))
                .await
                .unwrap();
            let receipt = match outcome {
                DebitOutcome::Completed(receipt) => receipt,
                other => panic!("expected completed debit, got {:?}", other),
            };

            assert_eq!(receipt.balance.credits, 15);
            assert_eq!(receipt.transactions.len(), 1);
            assert_eq!(receipt.transactions[0].amount, -25);

            // The backfilled lot is epoch-dated, non-expiring, fully drawn
            let grants = store.grants(&balance.id).await.unwrap();
            assert_eq!(grants.len(), 1);
            assert_eq!(grants[0].created_at, DateTime::<Utc>::UNIX_EPOCH);
            assert_eq!(grants[0].amount, 25);
            assert_eq!(grants[0].remaining, 0);
            assert!(grants[0].expires_at.is_none());
        });
    }

    #[test]
    fn test_legacy_only_mode_tracks_no_lots() {
        block_on(async {
            let config = LedgerConfig {
                grant_tracking: GrantTracking::LegacyOnly,
                ..LedgerConfig::default()
            };
            let store = MemoryStore::new(config);
            let owner = OwnerKey::new("session:old-schema");
            let balance = store.get_or_create_balance(&owner).await.unwrap();

            let credited = store
                .credit(&balance.id, 30, "Purchase", Some("pay_1"), None)
                .await
                .unwrap();
            match credited {
                CreditOutcome::Applied { grant, transaction } => {
                    assert!(grant.is_none());
                    assert!(transaction.grant_id.is_none());
                }
                other => panic!("expected applied credit, got {:?}", other),
            }

            let debited = store
                .debit(&balance.id, 10, "Extraction", None)
                .await
                .unwrap();
            match debited {
                DebitOutcome::Completed(receipt) => {
                    assert_eq!(receipt.balance.credits, 20);
                    assert!(receipt.transactions[0].grant_id.is_none());
                }
                other => panic!("expected completed debit, got {:?}", other),
            }

            assert!(store.grants(&balance.id).await.unwrap().is_empty());
        });
    }
}
