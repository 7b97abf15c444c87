//! Storage backends for the credit ledger.
//!
//! All correctness-critical mutation goes through the [`LedgerStore`] trait.
//! Implementations must provide two primitives and build every operation
//! from them: a guarded conditional update ("mutate only if the predicate
//! holds, report whether it matched") and an all-or-nothing multi-statement
//! unit. Read-check-write sequences in application code are not acceptable;
//! they are inherently racy.

use async_trait::async_trait;

use crate::balance::Balance;
use crate::error::LedgerResult;
use crate::grant::Grant;
use crate::transaction::Transaction;
use crate::types::{OwnerKey, Timestamp};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Outcome of a credit operation
#[derive(Debug, Clone)]
pub enum CreditOutcome {
    /// Credits were added and a new grant recorded
    Applied {
        /// The purchase transaction that was appended
        transaction: Transaction,
        /// The grant created for this credit event; `None` in legacy-only
        /// deployments
        grant: Option<Grant>,
    },
    /// A purchase with this source reference was already recorded; nothing
    /// changed and the original transaction is returned
    Duplicate {
        /// The previously recorded purchase transaction
        transaction: Transaction,
    },
}

impl CreditOutcome {
    /// The purchase transaction, whether freshly appended or deduplicated
    pub fn transaction(&self) -> &Transaction {
        match self {
            CreditOutcome::Applied { transaction, .. } => transaction,
            CreditOutcome::Duplicate { transaction } => transaction,
        }
    }

    /// Whether this credit was absorbed as a duplicate delivery
    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreditOutcome::Duplicate { .. })
    }
}

/// Receipt for a completed debit
#[derive(Debug, Clone)]
pub struct DebitReceipt {
    /// The balance after the debit
    pub balance: Balance,
    /// Usage transactions appended, one per lot drawn, summing to the
    /// negated debit amount
    pub transactions: Vec<Transaction>,
}

/// Outcome of a debit operation
#[derive(Debug, Clone)]
pub enum DebitOutcome {
    /// The guarded decrement succeeded and lots were consumed
    Completed(DebitReceipt),
    /// The balance cannot cover the amount. Definitive for this amount;
    /// nothing was changed
    InsufficientFunds {
        /// Credits available at the time of the attempt
        available: i64,
        /// Credits the caller asked for
        requested: i64,
    },
}

impl DebitOutcome {
    /// Whether the debit went through
    pub fn is_completed(&self) -> bool {
        matches!(self, DebitOutcome::Completed(_))
    }
}

/// Receipt for a completed transfer
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    /// The `-amount` transaction appended to the source balance
    pub outgoing: Transaction,
    /// The `+amount` transaction appended to the destination balance
    pub incoming: Transaction,
    /// Number of grants reassigned to the destination
    pub grants_moved: usize,
}

/// Outcome of a refund operation
#[derive(Debug, Clone)]
pub enum RefundOutcome {
    /// The unconsumed remainder of the purchase was returned
    Refunded {
        /// The refund transaction that was appended
        transaction: Transaction,
        /// Credits returned
        amount: i64,
    },
    /// The purchase grant is fully consumed or expired; nothing to return
    NothingToRefund,
}

/// The repository abstraction every ledger operation runs against.
///
/// Both backends, the in-memory store and the PostgreSQL store, satisfy
/// the same atomicity contracts and pass the same property suite.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Return the balance for an owner key, creating it with zero credits on
    /// first touch. Safe under concurrent first-touch: two simultaneous
    /// creations for one owner key must resolve to a single balance.
    async fn get_or_create_balance(&self, owner_key: &OwnerKey) -> LedgerResult<Balance>;

    /// Look up a balance by id
    async fn balance(&self, balance_id: &str) -> LedgerResult<Option<Balance>>;

    /// Look up a balance by owner key
    async fn balance_by_owner(&self, owner_key: &OwnerKey) -> LedgerResult<Option<Balance>>;

    /// Atomically add credits: balance increment, new grant, and purchase
    /// transaction commit together. When `source_reference` matches an
    /// existing purchase on this balance, the prior transaction is returned
    /// unchanged and no state is touched.
    async fn credit(
        &self,
        balance_id: &str,
        amount: i64,
        description: &str,
        source_reference: Option<&str>,
        expires_at: Option<Timestamp>,
    ) -> LedgerResult<CreditOutcome>;

    /// Atomically subtract credits iff the balance covers the amount, then
    /// consume lots FIFO and append the matching usage transactions. A
    /// failed guard returns `InsufficientFunds` with no side effects.
    async fn debit(
        &self,
        balance_id: &str,
        amount: i64,
        description: &str,
        file_type: Option<&str>,
    ) -> LedgerResult<DebitOutcome>;

    /// Atomically move `amount` credits and every unconsumed lot from one
    /// balance to another. Fails with `TransferValidation` and no change if
    /// either balance is missing or the source cannot cover the amount.
    async fn transfer(
        &self,
        from_balance_id: &str,
        to_balance_id: &str,
        amount: i64,
        description: &str,
    ) -> LedgerResult<TransferReceipt>;

    /// Atomically return the unconsumed remainder of the purchase grant
    /// matching `source_reference`: zero the lot, decrement the balance,
    /// append a refund transaction.
    async fn refund_purchase(
        &self,
        balance_id: &str,
        source_reference: &str,
        description: &str,
    ) -> LedgerResult<RefundOutcome>;

    /// List a balance's transactions, newest first
    async fn transactions(
        &self,
        balance_id: &str,
        limit: usize,
    ) -> LedgerResult<Vec<Transaction>>;

    /// List a balance's grants in consumption order
    async fn grants(&self, balance_id: &str) -> LedgerResult<Vec<Grant>>;
}
