//! Claim loop feeding the dispatch channel.
//!
//! One poller per engine. Claims batches of queued message ids and pushes
//! them into the bounded channel; backs off exponentially with jitter when
//! the database is unavailable. On cancellation it drops the channel sender,
//! which lets sender tasks drain what is left and exit.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kurier_core::MessageId;

use crate::{engine::WorkerContext, retry::apply_jitter};

/// Growth factor for the claim-error backoff.
const BACKOFF_GROWTH: f64 = 1.6;

/// Jitter fraction applied to backoff sleeps.
const BACKOFF_JITTER: f64 = 0.2;

pub(crate) async fn run(ctx: WorkerContext, tx: mpsc::Sender<MessageId>) {
    info!(batch_size = ctx.config.batch_size, "poller starting");

    let mut backoff = ctx.config.db_backoff_min;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let ids = match ctx.storage.messages.claim_queued(ctx.config.batch_size).await {
            Ok(ids) => ids,
            Err(error) => {
                let sleep = apply_jitter(backoff, BACKOFF_JITTER);
                warn!(error = %error, backoff = ?sleep, "claim failed, backing off");
                tokio::select! {
                    () = ctx.cancel.cancelled() => break,
                    () = ctx.clock.sleep(sleep) => {},
                }
                backoff = backoff.mul_f64(BACKOFF_GROWTH).min(ctx.config.db_backoff_max);
                continue;
            },
        };
        backoff = ctx.config.db_backoff_min;

        if ids.is_empty() {
            tokio::select! {
                () = ctx.cancel.cancelled() => break,
                () = ctx.clock.sleep(ctx.config.idle_sleep) => {},
            }
            continue;
        }

        debug!(claimed = ids.len(), "claimed batch");
        {
            let mut stats = ctx.stats.write().await;
            stats.claimed += ids.len() as u64;
        }

        for id in ids {
            tokio::select! {
                () = ctx.cancel.cancelled() => {
                    // Unsent ids stay in `sending`; the reaper requeues them.
                    info!("poller cancelled mid-dispatch");
                    return;
                },
                sent = tx.send(id) => {
                    if sent.is_err() {
                        warn!("dispatch channel closed, poller stopping");
                        return;
                    }
                },
            }
        }

        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            () = ctx.clock.sleep(ctx.config.poll_interval) => {},
        }
    }

    info!("poller stopped");
    // Dropping `tx` here closes the channel; senders drain and exit.
}
