//! Error types and result handling for gateway operations.
//!
//! Defines the error taxonomy with stable codes for client disambiguation.
//! Covers validation failures, business preconditions, missing entities, and
//! storage failures across the enqueue and dispatch pipeline.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for gateway operations.
///
/// An idempotent replay of `enqueue_and_charge` is not an error; it returns
/// the existing message id with an `already` flag instead.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Top-up amount was zero or negative.
    #[error("invalid amount: must be positive")]
    InvalidAmount,

    /// Send request had an empty destination or body.
    #[error("invalid body: destination and body must be non-empty")]
    InvalidBody,

    /// Caller did not identify the owning user.
    #[error("user id is required")]
    UserIdRequired,

    /// The user cannot afford the message. Never retried.
    #[error("insufficient balance")]
    InsufficientBalance,

    /// No user with the given id.
    #[error("user not found")]
    UserNotFound,

    /// No message with the given id in the caller's scope.
    #[error("message not found")]
    MessageNotFound,

    /// Constraint violation reported by the database.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),
}

impl CoreError {
    /// Stable machine-readable code surfaced through the API.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount => "invalid_amount",
            Self::InvalidBody => "invalid_body",
            Self::UserIdRequired => "user_id_required",
            Self::InsufficientBalance => "insufficient_balance",
            Self::UserNotFound => "user_not_found",
            Self::MessageNotFound => "not_found",
            Self::ConstraintViolation(_) => "conflict",
            Self::Database(_) => "storage_error",
        }
    }

    /// Whether the failure may succeed on a later attempt.
    ///
    /// Validation and precondition failures are caller bugs or business
    /// outcomes; only storage failures are worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::MessageNotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Returns true when the error is the unique-index collision raised by two
/// concurrent enqueues racing on the same idempotency key.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
