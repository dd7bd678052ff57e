//! Repository for message database operations.
//!
//! Implements the queue semantics of the dispatch pipeline: lock-free
//! claiming with `FOR UPDATE SKIP LOCKED`, terminal transitions, the retry
//! path, and reporting queries.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{Message, MessageFilter, MessageId, MessageStatus, SendJob, SendRequest, UserId},
};

const MESSAGE_COLUMNS: &str = "id, user_id, to_msisdn, body, status, provider_message_id, \
     error_code, requested_at, send_after, last_attempt_at, sent_at, delivered_at, attempts, \
     idempotency_key";

/// Repository for message database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new message in state `queued` inside a transaction.
    ///
    /// A concurrent insert racing on the same `(user_id, idempotency_key)`
    /// surfaces as a unique violation; the caller re-reads the winner.
    pub(crate) async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &SendRequest,
    ) -> std::result::Result<MessageId, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO messages(user_id, to_msisdn, body, status, idempotency_key)
             VALUES($1, $2, $3, 'queued', $4)
             RETURNING id",
        )
        .bind(request.user_id)
        .bind(&request.to)
        .bind(&request.body)
        .bind(request.idempotency_key.as_deref())
        .fetch_one(&mut **tx)
        .await
    }

    /// Idempotency probe inside a transaction.
    pub(crate) async fn find_id_by_key_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        key: &str,
    ) -> Result<Option<MessageId>> {
        let id = sqlx::query_scalar(
            "SELECT id FROM messages WHERE user_id = $1 AND idempotency_key = $2",
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Idempotency probe outside any transaction.
    ///
    /// Used to re-read the winning row after a unique-index collision.
    pub(crate) async fn find_id_by_key(
        &self,
        user_id: UserId,
        key: &str,
    ) -> Result<Option<MessageId>> {
        let id = sqlx::query_scalar(
            "SELECT id FROM messages WHERE user_id = $1 AND idempotency_key = $2",
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Claims up to `limit` eligible messages for dispatch.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent claimers never block each
    /// other and never receive the same id. Claimed rows move to `sending`
    /// with `attempts` incremented exactly once; the transition is
    /// observable only after the transaction commits.
    ///
    /// An empty result while other claimers are mid-commit is normal; the
    /// worker retries.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_queued(&self, limit: i64) -> Result<Vec<MessageId>> {
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let ids: Vec<MessageId> = sqlx::query_scalar(
            r"
            SELECT id FROM messages
            WHERE status = 'queued' AND send_after <= $1
            ORDER BY requested_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| id.0).collect();
        sqlx::query(
            "UPDATE messages
             SET status = 'sending', attempts = attempts + 1, last_attempt_at = $2
             WHERE id = ANY($1)",
        )
        .bind(&uuids)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ids)
    }

    /// Read-only fetch of the fields a sender needs for the provider call.
    ///
    /// # Errors
    ///
    /// Returns `MessageNotFound` if the row is missing.
    pub async fn load_for_send(&self, id: MessageId) -> Result<SendJob> {
        let job = sqlx::query_as::<_, (UserId, String, String, i32)>(
            "SELECT user_id, to_msisdn, body, attempts FROM messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or(CoreError::MessageNotFound)?;

        Ok(SendJob { user_id: job.0, to: job.1, body: job.2, attempts: job.3 })
    }

    /// Marks a message accepted by the provider. Terminal.
    ///
    /// A no-op if the message is already `sent`, so repeated application
    /// from the same terminal state cannot rewrite `sent_at` or the
    /// provider id.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_sent(&self, id: MessageId, provider_message_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE messages
             SET status = 'sent', provider_message_id = $2, sent_at = NOW(), error_code = NULL
             WHERE id = $1 AND status <> 'sent'",
        )
        .bind(id)
        .bind(provider_message_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns a message to the queue after a transient failure.
    ///
    /// Sets `send_after` into the future so the claim scan skips it until
    /// the retry delay elapses. The balance is untouched; the message is
    /// still owed. `attempts` already reflects the prior claim.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed_retry(&self, id: MessageId, retry_in: Duration) -> Result<()> {
        let send_after = Utc::now()
            + chrono::Duration::from_std(retry_in)
                .map_err(|e| CoreError::Database(format!("retry delay out of range: {e}")))?;

        sqlx::query(
            "UPDATE messages
             SET status = 'queued', send_after = $2
             WHERE id = $1 AND status = 'sending'",
        )
        .bind(id)
        .bind(send_after)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a message permanently failed without any ledger movement.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(&self, id: MessageId, error_code: &str) -> Result<()> {
        sqlx::query(
            "UPDATE messages
             SET status = 'failed', error_code = $2
             WHERE id = $1 AND status NOT IN ('sent', 'failed')",
        )
        .bind(id)
        .bind(error_code)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Locks a message row and returns its owner and current status.
    ///
    /// The refund path reads the status under lock so the at-most-once
    /// refund check cannot race with a concurrent resolution.
    pub(crate) async fn lock_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: MessageId,
    ) -> Result<(UserId, MessageStatus)> {
        let row = sqlx::query_as::<_, (UserId, MessageStatus)>(
            "SELECT user_id, status FROM messages WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(CoreError::MessageNotFound)?;

        Ok(row)
    }

    /// Marks a message failed inside a transaction.
    pub(crate) async fn mark_failed_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: MessageId,
        error_code: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE messages SET status = 'failed', error_code = $2 WHERE id = $1")
            .bind(id)
            .bind(error_code)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// Finds a message by id within its owner's scope.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, user_id: UserId, id: MessageId) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 AND user_id = $2"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(message)
    }

    /// Lists a user's messages, newest first, with optional filters.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn query(&self, user_id: UserId, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = "));
        builder.push_bind(user_id);

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.to_string());
        }
        if let Some(from) = filter.from {
            builder.push(" AND requested_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            builder.push(" AND requested_at < ").push_bind(to);
        }

        builder
            .push(" ORDER BY requested_at DESC LIMIT ")
            .push_bind(filter.effective_limit())
            .push(" OFFSET ")
            .push_bind(filter.effective_offset());

        let messages = builder.build_query_as::<Message>().fetch_all(&*self.pool).await?;

        Ok(messages)
    }

    /// Counts messages in one status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: MessageStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE status = $1")
            .bind(status)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }

    /// Rescues messages stuck in `sending` after a worker crash.
    ///
    /// A row whose claim is older than `older_than` and that never reached a
    /// terminal state goes back to `queued`. Neither credits nor attempts
    /// move; the next claim increments `attempts` as usual.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue_stuck(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| CoreError::Database(format!("reap threshold out of range: {e}")))?;

        let result = sqlx::query(
            "UPDATE messages
             SET status = 'queued'
             WHERE status = 'sending' AND sent_at IS NULL AND last_attempt_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
