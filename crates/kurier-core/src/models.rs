//! Core domain models and strongly-typed identifiers.
//!
//! Defines users, messages, the balance-transaction ledger, and newtype ID
//! wrappers for compile-time type safety. Includes database serialization
//! traits and the status machine for the message dispatch pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Cost of a single-part SMS in prepaid credits.
pub const PRICE_PER_SMS: i64 = 1;

/// Strongly-typed user identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. Every operation in
/// the gateway is scoped to a user.
///
/// # Example
///
/// ```
/// use kurier_core::models::UserId;
/// let user_id = UserId::new();
/// println!("charging user: {}", user_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Creates a new random user ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for UserId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for UserId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for UserId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed message identifier.
///
/// Follows a message through its entire lifecycle, from enqueue to the
/// terminal `sent` or `failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for MessageId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for MessageId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Message lifecycle status.
///
/// Messages progress through these states during dispatch. State transitions
/// are controlled by the storage layer under transactional guards:
///
/// ```text
/// queued -> sending -> sent
///       ^          |-> queued  (transient failure, send_after pushed out)
///       |          '-> failed  (permanent failure)
///       '-- retry wait elapses
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting in the queue; eligible for claiming once `send_after` passes.
    Queued,

    /// Claimed by a worker; at most one worker observes a message in this
    /// state between the claim commit and its terminal resolution.
    Sending,

    /// Accepted by the provider. Terminal.
    Sent,

    /// Permanently failed. Terminal except for operator action.
    Failed,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Sending => write!(f, "sending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for MessageStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "queued" => Ok(Self::Queued),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid message status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for MessageStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Kind of a balance ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Credits purchased by the user.
    Topup,
    /// One message charged at enqueue time.
    Debit,
    /// Credit returned after a permanent failure that never reached the
    /// provider.
    Refund,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topup => write!(f, "topup"),
            Self::Debit => write!(f, "debit"),
            Self::Refund => write!(f, "refund"),
        }
    }
}

impl sqlx::Type<PgDb> for TransactionKind {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TransactionKind {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "topup" => Ok(Self::Topup),
            "debit" => Ok(Self::Debit),
            "refund" => Ok(Self::Refund),
            _ => Err(format!("invalid transaction kind: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for TransactionKind {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Account holding prepaid credits.
///
/// The balance is mutated only by `top_up`, the conditional debit inside
/// `enqueue_and_charge`, and the refund path. It never goes negative at any
/// committed state; the database CHECK constraint backs the conditional
/// update.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    /// Unique identifier for this user.
    pub id: UserId,

    /// Human-readable account name.
    pub name: String,

    /// Current prepaid credit balance. Always >= 0.
    pub balance: i64,

    /// When this user was created.
    pub created_at: DateTime<Utc>,
}

/// A queued, in-flight, or resolved SMS.
///
/// Created by `enqueue_and_charge` in state `queued` and mutated only by the
/// storage layer under transactional guards. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,

    /// User charged for this message.
    pub user_id: UserId,

    /// Destination address in E.164 form.
    #[sqlx(rename = "to_msisdn")]
    #[serde(rename = "to")]
    pub to: String,

    /// Message text.
    pub body: String,

    /// Current dispatch status.
    pub status: MessageStatus,

    /// Identifier assigned by the provider. Non-null once `sent`.
    pub provider_message_id: Option<String>,

    /// Classification of the last permanent failure, if any.
    pub error_code: Option<String>,

    /// When the client submitted the message. Queue ordering key.
    pub requested_at: DateTime<Utc>,

    /// Earliest eligible dispatch time. Pushed into the future on retry.
    pub send_after: DateTime<Utc>,

    /// When a worker last claimed this message. Drives the reaper.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When the provider accepted the message (terminal state).
    pub sent_at: Option<DateTime<Utc>>,

    /// Reserved for delivery-receipt ingestion; never written by the core.
    pub delivered_at: Option<DateTime<Utc>>,

    /// Number of claims so far. Incremented exactly once per claim.
    pub attempts: i32,

    /// Caller-supplied token making enqueue retry-safe. Unique per user
    /// when present.
    pub idempotency_key: Option<String>,
}

/// Append-only balance ledger entry.
///
/// For every user the invariant `balance == Σ topup + Σ refund − Σ debit`
/// holds after each committed transaction.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BalanceTransaction {
    /// Unique identifier for this ledger row.
    pub id: Uuid,

    /// User whose balance moved.
    pub user_id: UserId,

    /// Direction and cause of the movement.
    pub kind: TransactionKind,

    /// Positive number of credits moved.
    pub amount: i64,

    /// Message linked to a debit or refund; null for top-ups.
    pub message_id: Option<MessageId>,

    /// When the movement was committed.
    pub created_at: DateTime<Utc>,
}

/// Input to the enqueue-and-charge operation.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// User to charge.
    pub user_id: UserId,
    /// Destination address.
    pub to: String,
    /// Message text.
    pub body: String,
    /// Optional idempotency key scoped to the user.
    pub idempotency_key: Option<String>,
}

/// The fields a sender needs to call the provider.
///
/// `attempts` reflects the claim that produced this job, so the worker can
/// apply its attempts-based retry policy without another read.
#[derive(Debug, Clone)]
pub struct SendJob {
    /// Owning user, used for per-user throttling.
    pub user_id: UserId,
    /// Destination address.
    pub to: String,
    /// Message text.
    pub body: String,
    /// Claim count including the one that produced this job.
    pub attempts: i32,
}

/// Optional filters for message listings.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Restrict to one status.
    pub status: Option<MessageStatus>,
    /// Inclusive lower bound on `requested_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `requested_at`.
    pub to: Option<DateTime<Utc>>,
    /// Page size; clamped to 1..=500, default 50.
    pub limit: Option<i64>,
    /// Page offset.
    pub offset: Option<i64>,
}

impl MessageFilter {
    /// Maximum page size accepted by listings.
    pub const MAX_LIMIT: i64 = 500;

    /// Page size used when the caller does not supply one.
    pub const DEFAULT_LIMIT: i64 = 50;

    /// Effective page size after clamping.
    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }

    /// Effective offset, never negative.
    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}
