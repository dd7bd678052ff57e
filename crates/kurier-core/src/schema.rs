//! Database schema management.
//!
//! Idempotent migrations run at service startup and by the test template
//! builder. The partial unique index on `(user_id, idempotency_key)` backs
//! the exactly-one-debit guarantee; the `(status, send_after, requested_at)`
//! index backs the claim scan.

use sqlx::PgPool;

use crate::error::Result;

/// Creates all tables and indexes if they do not exist yet.
///
/// # Errors
///
/// Returns `CoreError::Database` if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            name TEXT NOT NULL,
            balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id UUID NOT NULL REFERENCES users(id),
            to_msisdn TEXT NOT NULL,
            body TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            provider_message_id TEXT,
            error_code TEXT,
            requested_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            send_after TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_attempt_at TIMESTAMPTZ,
            sent_at TIMESTAMPTZ,
            delivered_at TIMESTAMPTZ,
            attempts INTEGER NOT NULL DEFAULT 0,
            idempotency_key TEXT
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_idempotency
        ON messages(user_id, idempotency_key)
        WHERE idempotency_key IS NOT NULL
        ",
    )
    .execute(pool)
    .await?;

    // Claim scan: status equality, send_after range, requested_at order.
    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_messages_queue
        ON messages(status, send_after, requested_at)
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_messages_user
        ON messages(user_id, requested_at DESC)
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS balance_transactions (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id UUID NOT NULL REFERENCES users(id),
            kind TEXT NOT NULL,
            amount BIGINT NOT NULL CHECK (amount > 0),
            message_id UUID REFERENCES messages(id),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_balance_transactions_user
        ON balance_transactions(user_id, created_at)
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}
