//! PostgreSQL ledger store using sqlx.
//!
//! Correctness comes from the database's own primitives: guarded
//! conditional updates (`UPDATE ... WHERE <guard>` checked through
//! `rows_affected`) and multi-statement transactions. Rows touched by a
//! multi-row unit are locked `FOR UPDATE`, always in balance-id order for
//! two-balance operations.

use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tracing::{debug, error, info};

use crate::balance::Balance;
use crate::config::{GrantTracking, LedgerConfig};
use crate::error::{LedgerError, LedgerResult};
use crate::grant::{plan_consumption, Grant, GrantDraw};
use crate::store::{
    CreditOutcome, DebitOutcome, DebitReceipt, LedgerStore, RefundOutcome, TransferReceipt,
};
use crate::transaction::{Transaction, TransactionKind};
use crate::types::{OwnerKey, Timestamp};

use async_trait::async_trait;

/// PostgreSQL implementation of [`LedgerStore`]
pub struct PostgresStore {
    pool: PgPool,
    config: LedgerConfig,
}

impl PostgresStore {
    /// Connect to PostgreSQL and build a store
    pub async fn connect(connection_string: &str, config: LedgerConfig) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(connection_string)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool, config })
    }

    /// Build a store around an existing pool
    pub fn new(pool: PgPool, config: LedgerConfig) -> Self {
        Self { pool, config }
    }

    /// The underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables and indexes if they do not exist
    pub async fn init_schema(&self) -> LedgerResult<()> {
        info!("Initializing ledger schema...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_balances (
                id TEXT PRIMARY KEY,
                owner_key TEXT NOT NULL UNIQUE,
                credits BIGINT NOT NULL DEFAULT 0 CHECK (credits >= 0),
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_grants (
                id TEXT PRIMARY KEY,
                balance_id TEXT NOT NULL REFERENCES ledger_balances(id),
                amount BIGINT NOT NULL,
                remaining BIGINT NOT NULL CHECK (remaining >= 0),
                description TEXT NOT NULL,
                source_reference TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS ledger_grants_fifo
                ON ledger_grants (balance_id, created_at, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_transactions (
                id TEXT PRIMARY KEY,
                balance_id TEXT NOT NULL REFERENCES ledger_balances(id),
                grant_id TEXT,
                kind TEXT NOT NULL,
                amount BIGINT NOT NULL,
                description TEXT NOT NULL,
                file_type TEXT,
                source_reference TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Backstop for idempotent purchase recording; the row lock taken by
        // credit() already serializes normal duplicate deliveries
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ledger_transactions_purchase_dedup
                ON ledger_transactions (balance_id, source_reference)
                WHERE kind = 'purchase' AND source_reference IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS ledger_transactions_recent
                ON ledger_transactions (balance_id, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Ledger schema initialized");
        Ok(())
    }

    fn grant_tracking(&self) -> bool {
        self.config.grant_tracking == GrantTracking::Enabled
    }
}

fn balance_from_row(row: &PgRow) -> Balance {
    Balance {
        id: row.get("id"),
        owner_key: OwnerKey::new(row.get::<String, _>("owner_key")),
        credits: row.get("credits"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn grant_from_row(row: &PgRow) -> Grant {
    Grant {
        id: row.get("id"),
        balance_id: row.get("balance_id"),
        amount: row.get("amount"),
        remaining: row.get("remaining"),
        description: row.get("description"),
        source_reference: row.get("source_reference"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    }
}

fn transaction_from_row(row: &PgRow) -> LedgerResult<Transaction> {
    Ok(Transaction {
        id: row.get("id"),
        balance_id: row.get("balance_id"),
        grant_id: row.get("grant_id"),
        kind: TransactionKind::parse(&row.get::<String, _>("kind"))?,
        amount: row.get("amount"),
        description: row.get("description"),
        file_type: row.get("file_type"),
        source_reference: row.get("source_reference"),
        created_at: row.get("created_at"),
    })
}

async fn insert_grant(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    grant: &Grant,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ledger_grants
            (id, balance_id, amount, remaining, description, source_reference, created_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&grant.id)
    .bind(&grant.balance_id)
    .bind(grant.amount)
    .bind(grant.remaining)
    .bind(&grant.description)
    .bind(&grant.source_reference)
    .bind(grant.created_at)
    .bind(grant.expires_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    transaction: &Transaction,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ledger_transactions
            (id, balance_id, grant_id, kind, amount, description, file_type, source_reference, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(&transaction.id)
    .bind(&transaction.balance_id)
    .bind(&transaction.grant_id)
    .bind(transaction.kind.as_str())
    .bind(transaction.amount)
    .bind(&transaction.description)
    .bind(&transaction.file_type)
    .bind(&transaction.source_reference)
    .bind(transaction.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn get_or_create_balance(&self, owner_key: &OwnerKey) -> LedgerResult<Balance> {
        if let Some(balance) = self.balance_by_owner(owner_key).await? {
            return Ok(balance);
        }

        // Concurrent first-touch resolves through the unique owner_key
        // constraint: exactly one insert wins, everyone reads the winner
        let balance = Balance::new(owner_key.clone());
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_balances (id, owner_key, credits, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (owner_key) DO NOTHING
            "#,
        )
        .bind(&balance.id)
        .bind(balance.owner_key.as_str())
        .bind(balance.credits)
        .bind(balance.created_at)
        .bind(balance.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.balance_by_owner(owner_key).await?.ok_or_else(|| {
                LedgerError::Storage(format!(
                    "Lost balance for owner {} after conflicting insert",
                    owner_key
                ))
            });
        }

        info!(balance_id = %balance.id, owner_key = %owner_key, "Created balance");
        Ok(balance)
    }

    async fn balance(&self, balance_id: &str) -> LedgerResult<Option<Balance>> {
        let row = sqlx::query(
            "SELECT id, owner_key, credits, created_at, updated_at FROM ledger_balances WHERE id = $1",
        )
        .bind(balance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| balance_from_row(&row)))
    }

    async fn balance_by_owner(&self, owner_key: &OwnerKey) -> LedgerResult<Option<Balance>> {
        let row = sqlx::query(
            "SELECT id, owner_key, credits, created_at, updated_at FROM ledger_balances WHERE owner_key = $1",
        )
        .bind(owner_key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| balance_from_row(&row)))
    }

    async fn credit(
        &self,
        balance_id: &str,
        amount: i64,
        description: &str,
        source_reference: Option<&str>,
        expires_at: Option<Timestamp>,
    ) -> LedgerResult<CreditOutcome> {
        let mut tx = self.pool.begin().await?;

        // Lock the balance row; this also serializes concurrent deliveries
        // of the same purchase notification
        let row = sqlx::query("SELECT id FROM ledger_balances WHERE id = $1 FOR UPDATE")
            .bind(balance_id)
            .fetch_optional(&mut *tx)
            .await?;
        if row.is_none() {
            return Err(LedgerError::BalanceNotFound(balance_id.to_string()));
        }

        if let Some(reference) = source_reference {
            let existing = sqlx::query(
                r#"
                SELECT id, balance_id, grant_id, kind, amount, description, file_type, source_reference, created_at
                FROM ledger_transactions
                WHERE balance_id = $1 AND kind = 'purchase' AND source_reference = $2
                "#,
            )
            .bind(balance_id)
            .bind(reference)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                let transaction = transaction_from_row(&row)?;
                tx.rollback().await?;
                debug!(
                    balance_id = %balance_id,
                    source_reference = %reference,
                    "Duplicate purchase delivery absorbed"
                );
                return Ok(CreditOutcome::Duplicate { transaction });
            }
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE ledger_balances SET credits = credits + $2, updated_at = $3 WHERE id = $1",
        )
        .bind(balance_id)
        .bind(amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let grant = if self.grant_tracking() {
            let grant = Grant::new(
                balance_id.to_string(),
                amount,
                description.to_string(),
                source_reference.map(|value| value.to_string()),
                expires_at,
            );
            insert_grant(&mut tx, &grant).await?;
            Some(grant)
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
        insert_transaction(&mut tx, &transaction).await?;

        tx.commit().await?;
        Ok(CreditOutcome::Applied { transaction, grant })
    }

    async fn debit(
        &self,
        balance_id: &str,
        amount: i64,
        description: &str,
        file_type: Option<&str>,
    ) -> LedgerResult<DebitOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT credits FROM ledger_balances WHERE id = $1 FOR UPDATE")
            .bind(balance_id)
            .fetch_optional(&mut *tx)
            .await?;
        let available: i64 = match row {
            Some(row) => row.get("credits"),
            None => return Err(LedgerError::BalanceNotFound(balance_id.to_string())),
        };

        // The guarded decrement; zero matched rows means the guard failed
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE ledger_balances
            SET credits = credits - $2, updated_at = $3
            WHERE id = $1 AND credits >= $2
            RETURNING id, owner_key, credits, created_at, updated_at
            "#,
        )
        .bind(balance_id)
        .bind(amount)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let balance = match updated {
            Some(row) => balance_from_row(&row),
            None => {
                tx.rollback().await?;
                return Ok(DebitOutcome::InsufficientFunds {
                    available,
                    requested: amount,
                });
            }
        };

        let mut transactions = Vec::new();

        if self.grant_tracking() {
            let rows = sqlx::query(
                r#"
                SELECT id, balance_id, amount, remaining, description, source_reference, created_at, expires_at
                FROM ledger_grants
                WHERE balance_id = $1
                  AND remaining > 0
                  AND (expires_at IS NULL OR expires_at > $2)
                ORDER BY created_at, id
                FOR UPDATE
                "#,
            )
            .bind(balance_id)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

            let grants: Vec<Grant> = rows.iter().map(grant_from_row).collect();
            let plan = plan_consumption(&grants, amount, now);

            let mut draws = plan.draws;
            if plan.shortfall > 0 {
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
                insert_grant(&mut tx, &legacy).await?;
                draws.insert(
                    0,
                    GrantDraw {
                        grant_id: legacy.id,
                        amount: plan.shortfall,
                    },
                );
            }

            for draw in draws {
                let result = sqlx::query(
                    "UPDATE ledger_grants SET remaining = remaining - $2 WHERE id = $1 AND remaining >= $2",
                )
                .bind(&draw.grant_id)
                .bind(draw.amount)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() == 0 {
                    error!(
                        grant_id = %draw.grant_id,
                        take = draw.amount,
                        "Grant consumption race detected"
                    );
                    tx.rollback().await?;
                    return Err(LedgerError::GrantRace(draw.grant_id));
                }

                let transaction = Transaction::new(
                    balance_id.to_string(),
                    Some(draw.grant_id.clone()),
                    TransactionKind::Usage,
                    -draw.amount,
                    description.to_string(),
                    file_type.map(|value| value.to_string()),
                    None,
                );
                insert_transaction(&mut tx, &transaction).await?;
                transactions.push(transaction);
            }
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
            insert_transaction(&mut tx, &transaction).await?;
            transactions.push(transaction);
        }

        tx.commit().await?;
        Ok(DebitOutcome::Completed(DebitReceipt {
            balance,
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

        let mut tx = self.pool.begin().await?;

        // Lock both rows, smaller balance id first, to prevent circular wait
        let mut ordered = [from_balance_id, to_balance_id];
        ordered.sort_unstable();
        let mut from_credits = None;
        for id in ordered {
            let row = sqlx::query("SELECT credits FROM ledger_balances WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                return Err(LedgerError::TransferValidation(format!(
                    "Balance not found: {}",
                    id
                )));
            };
            if id == from_balance_id {
                from_credits = Some(row.get::<i64, _>("credits"));
            }
        }

        let available = from_credits.unwrap_or(0);
        if available < amount {
            tx.rollback().await?;
            return Err(LedgerError::TransferValidation(format!(
                "Source balance {} has {} credits, cannot transfer {}",
                from_balance_id, available, amount
            )));
        }

        let now = Utc::now();
        let mut grants_moved = 0;

        if self.grant_tracking() {
            let rows = sqlx::query(
                r#"
                SELECT id, balance_id, amount, remaining, description, source_reference, created_at, expires_at
                FROM ledger_grants
                WHERE balance_id = $1 AND remaining > 0
                ORDER BY created_at, id
                FOR UPDATE
                "#,
            )
            .bind(from_balance_id)
            .fetch_all(&mut *tx)
            .await?;

            let unconsumed: i64 = rows
                .iter()
                .map(grant_from_row)
                .filter(|grant| grant.is_consumable(now))
                .map(|grant| grant.remaining)
                .sum();
            let shortfall = (amount - unconsumed).max(0);
            if shortfall > 0 {
                let legacy = Grant::legacy(
                    from_balance_id.to_string(),
                    shortfall,
                    self.config.legacy_grant_description.clone(),
                );
                insert_grant(&mut tx, &legacy).await?;
            }

            // Reassign every unconsumed lot; created_at is untouched so the
            // consumption order and purchase history survive the move
            let result = sqlx::query(
                "UPDATE ledger_grants SET balance_id = $2 WHERE balance_id = $1 AND remaining > 0",
            )
            .bind(from_balance_id)
            .bind(to_balance_id)
            .execute(&mut *tx)
            .await?;
            grants_moved = result.rows_affected() as usize;
        }

        let result = sqlx::query(
            r#"
            UPDATE ledger_balances
            SET credits = credits - $2, updated_at = $3
            WHERE id = $1 AND credits >= $2
            "#,
        )
        .bind(from_balance_id)
        .bind(amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(LedgerError::TransferValidation(format!(
                "Source balance {} can no longer cover {}",
                from_balance_id, amount
            )));
        }

        sqlx::query(
            "UPDATE ledger_balances SET credits = credits + $2, updated_at = $3 WHERE id = $1",
        )
        .bind(to_balance_id)
        .bind(amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;

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
        insert_transaction(&mut tx, &outgoing).await?;
        insert_transaction(&mut tx, &incoming).await?;

        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT id FROM ledger_balances WHERE id = $1 FOR UPDATE")
            .bind(balance_id)
            .fetch_optional(&mut *tx)
            .await?;
        if row.is_none() {
            return Err(LedgerError::BalanceNotFound(balance_id.to_string()));
        }

        let row = sqlx::query(
            r#"
            SELECT id, balance_id, amount, remaining, description, source_reference, created_at, expires_at
            FROM ledger_grants
            WHERE balance_id = $1 AND source_reference = $2
            ORDER BY created_at, id
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(balance_id)
        .bind(source_reference)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(LedgerError::GrantNotFound(format!(
                "No grant for purchase reference {} on balance {}",
                source_reference, balance_id
            )));
        };
        let grant = grant_from_row(&row);

        let now = Utc::now();
        if grant.is_spent() || grant.is_expired(now) {
            tx.rollback().await?;
            return Ok(RefundOutcome::NothingToRefund);
        }

        let refund_amount = grant.remaining;
        let result = sqlx::query(
            "UPDATE ledger_grants SET remaining = 0 WHERE id = $1 AND remaining = $2",
        )
        .bind(&grant.id)
        .bind(refund_amount)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            error!(grant_id = %grant.id, "Grant consumption race detected during refund");
            tx.rollback().await?;
            return Err(LedgerError::GrantRace(grant.id));
        }

        let result = sqlx::query(
            r#"
            UPDATE ledger_balances
            SET credits = credits - $2, updated_at = $3
            WHERE id = $1 AND credits >= $2
            "#,
        )
        .bind(balance_id)
        .bind(refund_amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(LedgerError::Storage(format!(
                "Balance {} cannot cover refund of grant {}",
                balance_id, grant.id
            )));
        }

        let transaction = Transaction::new(
            balance_id.to_string(),
            Some(grant.id),
            TransactionKind::Refund,
            -refund_amount,
            description.to_string(),
            None,
            Some(source_reference.to_string()),
        );
        insert_transaction(&mut tx, &transaction).await?;

        tx.commit().await?;
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
        let rows = sqlx::query(
            r#"
            SELECT id, balance_id, grant_id, kind, amount, description, file_type, source_reference, created_at
            FROM ledger_transactions
            WHERE balance_id = $1
            ORDER BY created_at DESC, id
            LIMIT $2
            "#,
        )
        .bind(balance_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn grants(&self, balance_id: &str) -> LedgerResult<Vec<Grant>> {
        let rows = sqlx::query(
            r#"
            SELECT id, balance_id, amount, remaining, description, source_reference, created_at, expires_at
            FROM ledger_grants
            WHERE balance_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(balance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(grant_from_row).collect())
    }
}
