//! Grant (lot) model and FIFO consumption planning.
//!
//! A grant is one discrete credit award (a purchase, a promotional award,
//! or a synthesized legacy lot) with its own remaining-amount counter.
//! Debits deplete the oldest consumable lot first so that refund
//! eligibility stays traceable to the purchase that funded each unit of
//! usage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{new_id, BalanceId, GrantId, Timestamp};

/// A discrete credit grant with remaining-amount tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    /// Grant ID
    pub id: GrantId,

    /// The balance this grant currently belongs to; reassigned on transfer
    pub balance_id: BalanceId,

    /// Credits originally granted
    pub amount: i64,

    /// Credits not yet consumed; only ever decreases
    pub remaining: i64,

    /// Human-readable description
    pub description: String,

    /// Reference to the purchase that funded this grant, e.g. a payment id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<String>,

    /// Creation time; preserved across transfers
    pub created_at: Timestamp,

    /// Expiry time, if the grant expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
}

impl Grant {
    /// Create a new grant with nothing consumed yet
    pub fn new(
        balance_id: BalanceId,
        amount: i64,
        description: String,
        source_reference: Option<String>,
        expires_at: Option<Timestamp>,
    ) -> Self {
        Self {
            id: new_id(),
            balance_id,
            amount,
            remaining: amount,
            description,
            source_reference,
            created_at: Utc::now(),
            expires_at,
        }
    }

    /// Create a legacy lot covering credits issued before lot tracking.
    ///
    /// Dated at the epoch so it sorts first in consumption order, and
    /// non-expiring so it can always absorb the shortfall it was made for.
    pub fn legacy(balance_id: BalanceId, amount: i64, description: String) -> Self {
        Self {
            id: new_id(),
            balance_id,
            amount,
            remaining: amount,
            description,
            source_reference: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            expires_at: None,
        }
    }

    /// Check whether the grant has expired as of `now`
    pub fn is_expired(&self, now: Timestamp) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }

    /// Check whether the grant is fully consumed
    pub fn is_spent(&self) -> bool {
        self.remaining == 0
    }

    /// Check whether the grant can still fund usage as of `now`
    pub fn is_consumable(&self, now: Timestamp) -> bool {
        !self.is_spent() && !self.is_expired(now)
    }
}

/// One draw against a single grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantDraw {
    /// The grant drawn from
    pub grant_id: GrantId,
    /// Credits taken from it
    pub amount: i64,
}

/// The result of planning FIFO consumption across a balance's grants
#[derive(Debug, Clone)]
pub struct ConsumptionPlan {
    /// Draws against existing grants, oldest first
    pub draws: Vec<GrantDraw>,
    /// Credits not covered by any tracked grant; the caller synthesizes a
    /// legacy lot for this and draws it before the planned draws
    pub shortfall: i64,
}

impl ConsumptionPlan {
    /// Total credits drawn from existing grants
    pub fn drawn(&self) -> i64 {
        self.draws.iter().map(|draw| draw.amount).sum()
    }
}

/// Plan FIFO consumption of `amount` credits across `grants`.
///
/// Candidates are the consumable grants ordered by `(created_at, id)`.
/// The plan draws `min(remaining, still needed)` from each candidate in
/// order. If the candidates cannot cover `amount`, which happens only for
/// balances whose credits predate lot tracking, the difference is reported
/// as `shortfall` rather than silently under-consuming.
pub fn plan_consumption(grants: &[Grant], amount: i64, now: Timestamp) -> ConsumptionPlan {
    let mut candidates: Vec<&Grant> = grants
        .iter()
        .filter(|grant| grant.is_consumable(now))
        .collect();
    candidates.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let capacity: i64 = candidates.iter().map(|grant| grant.remaining).sum();
    let shortfall = (amount - capacity).max(0);

    let mut needed = amount - shortfall;
    let mut draws = Vec::new();
    for grant in candidates {
        if needed == 0 {
            break;
        }
        let take = grant.remaining.min(needed);
        draws.push(GrantDraw {
            grant_id: grant.id.clone(),
            amount: take,
        });
        needed -= take;
    }

    ConsumptionPlan { draws, shortfall }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn grant_at(balance_id: &str, amount: i64, offset_secs: i64) -> Grant {
        let mut grant = Grant::new(
            balance_id.to_string(),
            amount,
            "Test grant".to_string(),
            None,
            None,
        );
        grant.created_at = DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(offset_secs);
        grant
    }

    #[test]
    fn test_plan_consumes_oldest_first() {
        let older = grant_at("b1", 10, 1);
        let newer = grant_at("b1", 10, 2);
        // Deliberately pass them newest-first
        let grants = vec![newer.clone(), older.clone()];

        let plan = plan_consumption(&grants, 15, Utc::now());

        assert_eq!(plan.shortfall, 0);
        assert_eq!(
            plan.draws,
            vec![
                GrantDraw {
                    grant_id: older.id,
                    amount: 10
                },
                GrantDraw {
                    grant_id: newer.id,
                    amount: 5
                },
            ]
        );
    }

    #[test]
    fn test_plan_skips_spent_and_expired_lots() {
        let now = Utc::now();

        let mut spent = grant_at("b1", 10, 1);
        spent.remaining = 0;

        let mut expired = grant_at("b1", 10, 2);
        expired.expires_at = Some(now - Duration::seconds(5));

        let usable = grant_at("b1", 10, 3);

        let grants = vec![spent, expired, usable.clone()];
        let plan = plan_consumption(&grants, 10, now);

        assert_eq!(plan.shortfall, 0);
        assert_eq!(
            plan.draws,
            vec![GrantDraw {
                grant_id: usable.id,
                amount: 10
            }]
        );
    }

    #[test]
    fn test_plan_reports_shortfall() {
        let only = grant_at("b1", 10, 1);
        let plan = plan_consumption(&[only.clone()], 25, Utc::now());

        assert_eq!(plan.shortfall, 15);
        assert_eq!(
            plan.draws,
            vec![GrantDraw {
                grant_id: only.id,
                amount: 10
            }]
        );
    }

    #[test]
    fn test_legacy_lot_sorts_first() {
        let tracked = grant_at("b1", 10, 100);
        let legacy = Grant::legacy("b1".to_string(), 5, "Legacy".to_string());

        let plan = plan_consumption(&[tracked.clone(), legacy.clone()], 8, Utc::now());

        assert_eq!(plan.draws[0].grant_id, legacy.id);
        assert_eq!(plan.draws[0].amount, 5);
        assert_eq!(plan.draws[1].grant_id, tracked.id);
        assert_eq!(plan.draws[1].amount, 3);
    }

    proptest! {
        #[test]
        fn prop_plan_accounts_for_every_credit(
            lots in prop::collection::vec((1i64..100, 0i64..100, any::<bool>()), 0..8),
            amount in 1i64..400,
        ) {
            let now = Utc::now();
            let grants: Vec<Grant> = lots
                .iter()
                .enumerate()
                .map(|(i, (amount, consumed, expired))| {
                    let mut grant = grant_at("b1", *amount, i as i64);
                    grant.remaining = (*amount - *consumed).max(0);
                    if *expired {
                        grant.expires_at = Some(now - Duration::seconds(1));
                    }
                    grant
                })
                .collect();

            let capacity: i64 = grants
                .iter()
                .filter(|grant| grant.is_consumable(now))
                .map(|grant| grant.remaining)
                .sum();

            let plan = plan_consumption(&grants, amount, now);

            // Drawn plus shortfall always covers the requested amount exactly
            prop_assert_eq!(plan.drawn() + plan.shortfall, amount);
            prop_assert_eq!(plan.shortfall, (amount - capacity).max(0));

            // No draw exceeds the lot it came from
            for draw in &plan.draws {
                let grant = grants.iter().find(|g| g.id == draw.grant_id).unwrap();
                prop_assert!(draw.amount > 0);
                prop_assert!(draw.amount <= grant.remaining);
                prop_assert!(grant.is_consumable(now));
            }

            // Draws come out oldest-first
            let times: Vec<_> = plan
                .draws
                .iter()
                .map(|draw| {
                    grants
                        .iter()
                        .find(|g| g.id == draw.grant_id)
                        .unwrap()
                        .created_at
                })
                .collect();
            prop_assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }
}
