//! Test infrastructure and utilities for deterministic testing.
//!
//! Provides per-test database isolation backed by a shared Postgres
//! container, fixture helpers for the common account/message setup, a
//! scripted provider, and a controllable clock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use anyhow::Result;
use kurier_core::{
    models::{Message, MessageId, MessageStatus, SendRequest, UserId},
    Storage,
};
use sqlx::PgPool;

pub mod database;
pub mod provider;
pub mod time;

pub use database::TestDatabase;
pub use provider::MockProvider;
pub use time::TestClock;

/// Test environment with an isolated database for integration testing.
///
/// Each environment owns a database cloned from a pre-migrated template, so
/// tests can commit freely without affecting each other.
pub struct TestEnv {
    database: TestDatabase,
    storage: Arc<Storage>,
}

impl TestEnv {
    /// Creates an environment with a fresh isolated database.
    ///
    /// # Errors
    ///
    /// Returns error if the container or database clone cannot be set up.
    pub async fn new() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();

        let database = TestDatabase::new().await?;
        let storage = Arc::new(Storage::new(database.pool().clone()));

        Ok(Self { database, storage })
    }

    /// Returns the connection pool of this environment's database.
    pub fn pool(&self) -> &PgPool {
        self.database.pool()
    }

    /// Returns the storage layer over this environment's database.
    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    /// Creates a user with balance zero.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_user(&self, name: &str) -> Result<UserId> {
        Ok(self.storage.users.create(name).await?)
    }

    /// Credits a user's balance.
    ///
    /// # Errors
    ///
    /// Returns error if the top-up fails.
    pub async fn top_up(&self, user_id: UserId, amount: i64) -> Result<()> {
        Ok(self.storage.top_up(user_id, amount).await?)
    }

    /// Enqueues one message for the user, charging one credit.
    ///
    /// # Errors
    ///
    /// Returns error if the enqueue fails.
    pub async fn enqueue(
        &self,
        user_id: UserId,
        to: &str,
        body: &str,
        idempotency_key: Option<&str>,
    ) -> Result<MessageId> {
        let (id, _already) = self
            .storage
            .enqueue_and_charge(&SendRequest {
                user_id,
                to: to.to_string(),
                body: body.to_string(),
                idempotency_key: idempotency_key.map(ToString::to_string),
            })
            .await?;
        Ok(id)
    }

    /// Current balance of a user.
    ///
    /// # Errors
    ///
    /// Returns error if the read fails.
    pub async fn balance(&self, user_id: UserId) -> Result<i64> {
        Ok(self.storage.users.balance(user_id).await?)
    }

    /// Reads a message row regardless of owner.
    ///
    /// # Errors
    ///
    /// Returns error if the row is missing.
    pub async fn message(&self, id: MessageId) -> Result<Message> {
        let message = sqlx::query_as::<_, Message>(
            "SELECT id, user_id, to_msisdn, body, status, provider_message_id, error_code,
                    requested_at, send_after, last_attempt_at, sent_at, delivered_at, attempts,
                    idempotency_key
             FROM messages WHERE id = $1",
        )
        .bind(id)
        .fetch_one(self.pool())
        .await?;

        Ok(message)
    }

    /// Current status of a message.
    ///
    /// # Errors
    ///
    /// Returns error if the row is missing.
    pub async fn message_status(&self, id: MessageId) -> Result<MessageStatus> {
        Ok(self.message(id).await?.status)
    }

    /// Polls until the message reaches the wanted status or the budget runs
    /// out.
    ///
    /// # Errors
    ///
    /// Returns error when the budget elapses first.
    pub async fn wait_for_status(
        &self,
        id: MessageId,
        wanted: MessageStatus,
        budget: std::time::Duration,
    ) -> Result<()> {
        let deadline = std::time::Instant::now() + budget;
        loop {
            if self.message_status(id).await? == wanted {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "message {id} did not reach {wanted} within {budget:?} (currently {})",
                    self.message_status(id).await?
                );
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}
