//! Prepaid credit ledger.
//!
//! This crate tracks how many usable credits an anonymous session or
//! authenticated account owns, debits credits atomically when chargeable
//! work starts, records the provenance of every credit grant (a "lot") for
//! refund eligibility, and moves credits between owners when a session is
//! claimed by an account.
//!
//! Balances never go negative, purchases are never double-applied even
//! under at-least-once notification delivery, and every unit of usage is
//! traceable to the purchase lot that funded it. Correctness under
//! concurrent access comes entirely from two backing-store primitives,
//! guarded conditional updates and all-or-nothing transaction units; no
//! operation is built from a read-check-write sequence in application code.
//!
//! Two interchangeable [`store::LedgerStore`] backends are provided: an
//! in-memory store for tests and single-process use, and a PostgreSQL
//! store for production. Both satisfy the same atomicity contracts.

mod balance;
mod config;
mod error;
mod grant;
mod ledger;
pub mod store;
mod transaction;
mod types;

pub use balance::Balance;
pub use config::{GrantTracking, LedgerConfig};
pub use error::{LedgerError, LedgerResult};
pub use grant::{plan_consumption, ConsumptionPlan, Grant, GrantDraw};
pub use ledger::CreditLedger;
pub use store::{
    CreditOutcome, DebitOutcome, DebitReceipt, LedgerStore, MemoryStore, PostgresStore,
    RefundOutcome, TransferReceipt,
};
pub use transaction::{Transaction, TransactionKind};
pub use types::{BalanceId, GrantId, OwnerKey, Timestamp, TransactionId};

/// Version of the credit ledger implementation
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
