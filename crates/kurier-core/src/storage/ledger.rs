//! Repository for the append-only balance-transaction ledger.
//!
//! Ledger rows are only ever written inside the same transaction as the
//! balance movement they record, which is what keeps the ledger equation
//! `balance == Σ topup + Σ refund − Σ debit` true at every commit.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{BalanceTransaction, MessageId, TransactionKind, UserId},
};

/// Repository for balance-transaction database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends a ledger row inside a transaction.
    pub(crate) async fn record_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        kind: TransactionKind,
        amount: i64,
        message_id: Option<MessageId>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO balance_transactions(user_id, kind, amount, message_id)
             VALUES($1, $2, $3, $4)",
        )
        .bind(user_id)
        .bind(kind)
        .bind(amount)
        .bind(message_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// All ledger rows for a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<BalanceTransaction>> {
        let rows = sqlx::query_as::<_, BalanceTransaction>(
            "SELECT id, user_id, kind, amount, message_id, created_at
             FROM balance_transactions
             WHERE user_id = $1
             ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Net credit movement for a user straight from the ledger.
    ///
    /// Equals the user's balance whenever the ledger invariant holds, which
    /// makes this the anchor for consistency checks.
    pub async fn net_for_user(&self, user_id: UserId) -> Result<i64> {
        let net: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(CASE WHEN kind = 'debit' THEN -amount ELSE amount END), 0)
             FROM balance_transactions
             WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(net)
    }

    /// Number of ledger rows of one kind linked to a message.
    ///
    /// Debit and refund uniqueness per message reduce to this count being
    /// at most one.
    pub async fn count_for_message(
        &self,
        message_id: MessageId,
        kind: TransactionKind,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM balance_transactions WHERE message_id = $1 AND kind = $2",
        )
        .bind(message_id)
        .bind(kind)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }
}
