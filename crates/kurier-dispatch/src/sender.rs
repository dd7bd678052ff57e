//! Sender tasks: the claim-to-resolution pipeline for one message.
//!
//! Each sender pulls ids off the dispatch channel, loads the message, takes
//! a per-user permit and a global rate token, calls the provider under the
//! send deadline, and records the outcome as a state transition. Failures
//! never propagate upward; every path ends in `sent`, a requeue, or a
//! refunded permanent failure.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use kurier_core::MessageId;

use crate::{engine::WorkerContext, error::DispatchError, retry::RetryDecision};

/// Error code recorded when the claimed row cannot be read back.
const ERROR_UNREADABLE: &str = "load_failed";

/// Error code recorded when the attempts cap is exhausted.
const ERROR_MAX_ATTEMPTS: &str = "max_attempts_exceeded";

/// Error code recorded when the provider rejects a message permanently.
const ERROR_REJECTED: &str = "provider_rejected";

pub(crate) async fn run(
    id: usize,
    ctx: WorkerContext,
    rx: Arc<Mutex<mpsc::Receiver<MessageId>>>,
) {
    info!(sender_id = id, "sender starting");

    loop {
        // Hold the lock only for the receive itself so senders interleave.
        let message_id = { rx.lock().await.recv().await };
        let Some(message_id) = message_id else {
            break; // channel closed and drained
        };

        send_one(&ctx, message_id).await;
    }

    info!(sender_id = id, "sender stopped");
}

/// Drives one message from `sending` to its next state.
async fn send_one(ctx: &WorkerContext, id: MessageId) {
    let job = match ctx.storage.messages.load_for_send(id).await {
        Ok(job) => job,
        Err(error) => {
            // The row is unreadable after a committed claim; the message
            // never reached the provider, so the credit goes back.
            warn!(message_id = %id, error = %error, "load failed, refunding");
            resolve_refund(ctx, id, ERROR_UNREADABLE).await;
            return;
        },
    };

    // Held for the duration of the provider call when the cap is enabled.
    let _user_permit = match &ctx.user_limiter {
        Some(limiter) => match limiter.acquire(job.user_id, &ctx.cancel).await {
            Some(permit) => Some(permit),
            None => {
                requeue(ctx, id, &job).await;
                return;
            },
        },
        None => None,
    };

    send_with_permit(ctx, id, &job).await;
}

/// Rate-limited provider call and outcome recording.
async fn send_with_permit(ctx: &WorkerContext, id: MessageId, job: &kurier_core::SendJob) {
    if !ctx.limiter.acquire(&ctx.cancel).await {
        // Cancelled while waiting for a token; give the message back to the
        // queue instead of leaving it stuck in `sending`.
        requeue(ctx, id, job).await;
        return;
    }

    {
        let mut stats = ctx.stats.write().await;
        stats.in_flight += 1;
    }

    let outcome =
        tokio::time::timeout(ctx.config.send_timeout, ctx.provider.send(&job.to, &job.body)).await;

    {
        let mut stats = ctx.stats.write().await;
        stats.in_flight -= 1;
    }

    match outcome {
        Ok(Ok(provider_id)) => {
            if let Err(error) = ctx.storage.messages.mark_sent(id, &provider_id).await {
                warn!(message_id = %id, error = %error, "mark_sent failed");
                return;
            }
            let mut stats = ctx.stats.write().await;
            stats.sent += 1;
            info!(message_id = %id, provider_id = %provider_id, "message sent");
        },
        Ok(Err(error)) => {
            resolve_failure(ctx, id, job, DispatchError::from(error)).await;
        },
        Err(_elapsed) => {
            let error = DispatchError::SendTimeout { timeout: ctx.config.send_timeout };
            resolve_failure(ctx, id, job, error).await;
        },
    }
}

/// Classifies a failed attempt and records its resolution.
///
/// Non-retryable failures skip the policy entirely and become refunded
/// permanent failures; retryable ones go through the attempts-based retry
/// decision.
async fn resolve_failure(
    ctx: &WorkerContext,
    id: MessageId,
    job: &kurier_core::SendJob,
    error: DispatchError,
) {
    warn!(message_id = %id, attempts = job.attempts, error = %error, "send attempt failed");

    if !error.is_retryable() {
        resolve_refund(ctx, id, ERROR_REJECTED).await;
        return;
    }

    match ctx.config.retry_policy.decide(job.attempts) {
        RetryDecision::Retry { delay } => {
            if let Err(error) = ctx.storage.messages.mark_failed_retry(id, delay).await {
                warn!(message_id = %id, error = %error, "retry scheduling failed");
                return;
            }
            let mut stats = ctx.stats.write().await;
            stats.retried += 1;
        },
        RetryDecision::GiveUp => {
            info!(message_id = %id, attempts = job.attempts, "attempts exhausted, giving up");
            resolve_refund(ctx, id, ERROR_MAX_ATTEMPTS).await;
        },
    }
}

/// Terminal failure with refund; the provider never accepted this message.
async fn resolve_refund(ctx: &WorkerContext, id: MessageId, error_code: &str) {
    match ctx.storage.mark_failed_refund(id, error_code).await {
        Ok(refunded) => {
            let mut stats = ctx.stats.write().await;
            stats.failed += 1;
            if refunded {
                stats.refunded += 1;
            }
        },
        Err(error) => {
            warn!(message_id = %id, error = %error, "refund failed");
        },
    }
}

/// Returns a message to the queue after an interrupted attempt.
async fn requeue(ctx: &WorkerContext, id: MessageId, job: &kurier_core::SendJob) {
    let delay = match ctx.config.retry_policy.decide(job.attempts) {
        RetryDecision::Retry { delay } => delay,
        RetryDecision::GiveUp => ctx.config.retry_policy.base_delay,
    };
    if let Err(error) = ctx.storage.messages.mark_failed_retry(id, delay).await {
        warn!(message_id = %id, error = %error, "requeue failed");
    }
}
