//! Request handlers for the gateway API.
//!
//! Each handler validates its input, invokes one core-service operation,
//! and maps the error taxonomy onto HTTP statuses. Idempotent replays of
//! message submission answer 200 instead of 202.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use kurier_core::{CoreError, MessageFilter, MessageId, MessageStatus, SendRequest, UserId};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::AppState;

/// Request body for user creation.
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    /// Human-readable account name.
    pub name: String,
}

/// Response from user creation.
#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    /// Id of the new user.
    pub id: UserId,
    /// Echo of the account name.
    pub name: String,
}

/// Request body for a balance top-up.
#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    /// Credits to add; must be positive.
    pub amount: i64,
}

/// Request body for message submission.
#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    /// Destination address.
    pub to: String,
    /// Message text.
    pub body: String,
}

/// Response carrying a message id.
#[derive(Debug, Serialize)]
pub struct MessageIdResponse {
    /// Id of the created or replayed message.
    pub id: MessageId,
}

/// Query parameters for message listings.
#[derive(Debug, Deserialize)]
pub struct ListMessagesParams {
    /// Owner whose messages to list.
    pub user_id: Option<Uuid>,
    /// Restrict to one status.
    pub status: Option<MessageStatus>,
    /// Inclusive lower bound on `requested_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `requested_at`.
    pub to: Option<DateTime<Utc>>,
    /// Page size, clamped server-side.
    pub limit: Option<i64>,
    /// Page offset.
    pub offset: Option<i64>,
}

/// Query parameters scoping a message lookup to its owner.
#[derive(Debug, Deserialize)]
pub struct GetMessageParams {
    /// Owner of the message.
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

/// Maps a core error onto the HTTP surface.
fn error_response(err: &CoreError) -> Response {
    let status = match err {
        CoreError::InvalidAmount | CoreError::InvalidBody | CoreError::UserIdRequired => {
            StatusCode::BAD_REQUEST
        },
        CoreError::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
        CoreError::UserNotFound | CoreError::MessageNotFound => StatusCode::NOT_FOUND,
        CoreError::ConstraintViolation(_) => StatusCode::CONFLICT,
        CoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }

    (status, Json(ErrorBody { error: err.code() })).into_response()
}

/// Creates a user with an initial balance of zero.
#[instrument(skip(state, request))]
pub async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Response {
    if request.name.is_empty() {
        return error_response(&CoreError::InvalidBody);
    }

    match state.storage.users.create(&request.name).await {
        Ok(id) => {
            info!(user_id = %id, "user created");
            (StatusCode::CREATED, Json(CreateUserResponse { id, name: request.name }))
                .into_response()
        },
        Err(err) => error_response(&err),
    }
}

/// Adds prepaid credits to a user's balance.
#[instrument(skip(state, request), fields(user_id = %user_id))]
pub async fn top_up(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<TopUpRequest>,
) -> Response {
    match state.storage.top_up(UserId(user_id), request.amount).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Reads a user's current balance.
#[instrument(skip(state), fields(user_id = %user_id))]
pub async fn get_balance(State(state): State<AppState>, Path(user_id): Path<Uuid>) -> Response {
    match state.storage.users.balance(UserId(user_id)).await {
        Ok(balance) => {
            (StatusCode::OK, Json(serde_json::json!({"balance": balance}))).into_response()
        },
        Err(err) => error_response(&err),
    }
}

/// Submits a message: debits one credit and admits it to the queue.
///
/// The owner comes from the `X-User-Id` header; an optional
/// `Idempotency-Key` header makes the call retry-safe. A fresh enqueue
/// answers 202, an idempotent replay 200 with the same id.
#[instrument(skip(state, headers, request))]
pub async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PostMessageRequest>,
) -> Response {
    let Some(user_id) = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
    else {
        return error_response(&CoreError::UserIdRequired);
    };

    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string);

    let send_request = SendRequest {
        user_id: UserId(user_id),
        to: request.to,
        body: request.body,
        idempotency_key,
    };

    match state.storage.enqueue_and_charge(&send_request).await {
        Ok((id, already)) => {
            let status = if already { StatusCode::OK } else { StatusCode::ACCEPTED };
            (status, Json(MessageIdResponse { id })).into_response()
        },
        Err(err) => error_response(&err),
    }
}

/// Lists a user's messages, newest first, with optional filters.
#[instrument(skip(state, params))]
pub async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<ListMessagesParams>,
) -> Response {
    let Some(user_id) = params.user_id else {
        return error_response(&CoreError::UserIdRequired);
    };

    let filter = MessageFilter {
        status: params.status,
        from: params.from,
        to: params.to,
        limit: params.limit,
        offset: params.offset,
    };

    match state.storage.messages.query(UserId(user_id), &filter).await {
        Ok(items) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "items": items,
                "limit": filter.effective_limit(),
                "offset": filter.effective_offset(),
            })),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Fetches one message, scoped to its owner.
#[instrument(skip(state, params), fields(message_id = %message_id))]
pub async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Query(params): Query<GetMessageParams>,
) -> Response {
    let Some(user_id) = params.user_id else {
        return error_response(&CoreError::UserIdRequired);
    };

    match state.storage.messages.find_by_id(UserId(user_id), MessageId(message_id)).await {
        Ok(Some(message)) => (StatusCode::OK, Json(message)).into_response(),
        Ok(None) => error_response(&CoreError::MessageNotFound),
        Err(err) => error_response(&err),
    }
}

/// Liveness probe.
pub async fn health_check() -> Response {
    (StatusCode::OK, "ok").into_response()
}

/// Readiness probe: verifies database connectivity.
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    match state.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ready").into_response(),
        Err(err) => {
            warn!(error = %err, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable").into_response()
        },
    }
}
