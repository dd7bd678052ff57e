//! Repository for user account database operations.
//!
//! Balance mutations here are building blocks; the transactional operations
//! that couple them with ledger rows live on [`super::Storage`].

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{User, UserId},
};

/// Repository for user account database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates a user with an initial balance of zero.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, name: &str) -> Result<UserId> {
        let id: UserId = sqlx::query_scalar("INSERT INTO users(name) VALUES($1) RETURNING id")
            .bind(name)
            .fetch_one(&*self.pool)
            .await?;

        Ok(id)
    }

    /// Finds a user by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, user_id: UserId) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, name, balance, created_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(user)
    }

    /// Current balance of a user.
    ///
    /// # Errors
    ///
    /// Returns `UserNotFound` if no such user exists.
    pub async fn balance(&self, user_id: UserId) -> Result<i64> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT balance FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&*self.pool)
            .await?;

        balance.ok_or(CoreError::UserNotFound)
    }

    /// Whether a user row exists, checked inside a transaction.
    pub(crate) async fn exists_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(&mut **tx)
            .await?;

        Ok(exists)
    }

    /// Unconditionally credits a balance inside a transaction.
    ///
    /// Used by top-ups and refunds. Returns `UserNotFound` if the user row
    /// is absent.
    pub(crate) async fn credit_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        amount: i64,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE users SET balance = balance + $1 WHERE id = $2")
            .bind(amount)
            .bind(user_id)
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::UserNotFound);
        }
        Ok(())
    }

    /// Conditionally debits a balance inside a transaction.
    ///
    /// The balance check and the mutation are one statement, so no
    /// concurrent transaction can interleave between them. Returns whether a
    /// row was debited; `false` means the balance was short or the user is
    /// unknown, which the caller disambiguates.
    pub(crate) async fn try_debit_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        amount: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET balance = balance - $1 WHERE id = $2 AND balance >= $1",
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
