//! Configuration for the credit ledger.

use serde::{Deserialize, Serialize};

/// Whether the backing schema tracks per-purchase grants.
///
/// Resolved once at startup from deployment configuration. Deployments
/// predating grant tracking run `LegacyOnly`, where debits and transfers
/// move bare balances and transactions carry no grant reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantTracking {
    /// Grants are recorded per credit event and consumed FIFO
    Enabled,
    /// Balance-only schema; no lot provenance
    LegacyOnly,
}

/// Configuration for the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Grant tracking capability of the backing schema
    pub grant_tracking: GrantTracking,
    /// Number of transactions returned by history queries when the caller
    /// does not pass a limit
    pub default_history_limit: usize,
    /// Description stamped on synthesized legacy lots
    pub legacy_grant_description: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            grant_tracking: GrantTracking::Enabled,
            default_history_limit: 50,
            legacy_grant_description: "Credits issued before lot tracking".to_string(),
        }
    }
}
