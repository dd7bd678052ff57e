//! Database access layer implementing the repository pattern.
//!
//! Repositories translate between domain models and the database schema;
//! operations that move both a balance and its ledger rows live on
//! [`Storage`] itself so the coupling always happens inside one
//! transaction. All database access goes through this module.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::debug;

pub mod ledger;
pub mod messages;
pub mod users;

use crate::{
    error::{self, CoreError, Result},
    models::{MessageId, SendRequest, TransactionKind, UserId, PRICE_PER_SMS},
};

/// Container for all repository instances providing unified database access.
///
/// The entry point for every database operation in the gateway. Repositories
/// share one connection pool; the cross-entity transactional operations
/// (`top_up`, `enqueue_and_charge`, `mark_failed_refund`) compose their
/// in-transaction helpers.
#[derive(Clone)]
pub struct Storage {
    /// Repository for user accounts and balances.
    pub users: Arc<users::Repository>,

    /// Repository for the message queue.
    pub messages: Arc<messages::Repository>,

    /// Repository for the balance-transaction ledger.
    pub ledger: Arc<ledger::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            users: Arc::new(users::Repository::new(pool.clone())),
            messages: Arc::new(messages::Repository::new(pool.clone())),
            ledger: Arc::new(ledger::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }

    /// Credits a user's balance and records the top-up in the ledger.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAmount` for non-positive amounts, `UserNotFound` for
    /// unknown users.
    pub async fn top_up(&self, user_id: UserId, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Err(CoreError::InvalidAmount);
        }

        let mut tx = self.pool.begin().await?;
        self.users.credit_in_tx(&mut tx, user_id, amount).await?;
        self.ledger.record_in_tx(&mut tx, user_id, TransactionKind::Topup, amount, None).await?;
        tx.commit().await?;

        debug!(user_id = %user_id, amount, "balance topped up");
        Ok(())
    }

    /// Atomically debits one credit and admits a message to the queue.
    ///
    /// The keystone operation. Within one transaction: probe the
    /// idempotency key, conditionally debit the balance, insert the message
    /// in state `queued`, and append the `debit` ledger row. For any number
    /// of concurrent calls sharing one `(user, key)` exactly one message is
    /// created and exactly one debit recorded; the losers observe the
    /// unique-index collision, re-read the winner's row, and return its id
    /// with `already = true`.
    ///
    /// # Errors
    ///
    /// `InvalidBody` for an empty destination or body, `InsufficientBalance`
    /// when the conditional debit affects no row, `UserNotFound` when the
    /// user does not exist.
    pub async fn enqueue_and_charge(&self, request: &SendRequest) -> Result<(MessageId, bool)> {
        if request.to.is_empty() || request.body.is_empty() {
            return Err(CoreError::InvalidBody);
        }

        let mut tx = self.pool.begin().await?;

        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) =
                self.messages.find_id_by_key_in_tx(&mut tx, request.user_id, key).await?
            {
                tx.commit().await?;
                debug!(message_id = %existing, "idempotent replay");
                return Ok((existing, true));
            }
        }

        if !self.users.try_debit_in_tx(&mut tx, request.user_id, PRICE_PER_SMS).await? {
            return if self.users.exists_in_tx(&mut tx, request.user_id).await? {
                Err(CoreError::InsufficientBalance)
            } else {
                Err(CoreError::UserNotFound)
            };
        }

        let message_id = match self.messages.create_in_tx(&mut tx, request).await {
            Ok(id) => id,
            Err(err) if error::is_unique_violation(&err) => {
                // A concurrent call won the race on this idempotency key.
                // Our transaction is aborted (the debit rolls back with it);
                // return the winner's id.
                drop(tx);
                return self.read_duplicate(request).await;
            },
            Err(err) => return Err(err.into()),
        };

        self.ledger
            .record_in_tx(&mut tx, request.user_id, TransactionKind::Debit, PRICE_PER_SMS, Some(message_id))
            .await?;

        tx.commit().await?;

        debug!(message_id = %message_id, user_id = %request.user_id, "message enqueued and charged");
        Ok((message_id, false))
    }

    /// Re-reads the row that won a unique-index race on the idempotency key.
    async fn read_duplicate(&self, request: &SendRequest) -> Result<(MessageId, bool)> {
        let key = request
            .idempotency_key
            .as_deref()
            .ok_or_else(|| CoreError::Database("unique violation without idempotency key".into()))?;

        match self.messages.find_id_by_key(request.user_id, key).await? {
            Some(id) => Ok((id, true)),
            None => Err(CoreError::Database(
                "idempotency collision but winning row not visible".into(),
            )),
        }
    }

    /// Marks a message permanently failed and refunds its credit.
    ///
    /// Used when the message never reached the provider. The message row is
    /// locked first so the refund happens at most once: a message already in
    /// a terminal state is left untouched and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns `MessageNotFound` if the row is missing.
    pub async fn mark_failed_refund(&self, id: MessageId, error_code: &str) -> Result<bool> {
        use crate::models::MessageStatus;

        let mut tx = self.pool.begin().await?;

        let (user_id, status) = self.messages.lock_in_tx(&mut tx, id).await?;
        if matches!(status, MessageStatus::Sent | MessageStatus::Failed) {
            tx.commit().await?;
            return Ok(false);
        }

        self.messages.mark_failed_in_tx(&mut tx, id, error_code).await?;
        self.users.credit_in_tx(&mut tx, user_id, PRICE_PER_SMS).await?;
        self.ledger
            .record_in_tx(&mut tx, user_id, TransactionKind::Refund, PRICE_PER_SMS, Some(id))
            .await?;

        tx.commit().await?;

        debug!(message_id = %id, user_id = %user_id, "message failed, credit refunded");
        Ok(true)
    }
}
