//! Engine lifecycle: configuration, task supervision, and shutdown.
//!
//! The engine owns one poller, a fixed pool of senders behind a bounded
//! channel, and a reaper that rescues messages stranded in `sending` by a
//! crashed worker. Cancellation propagates through a single token; shutdown
//! waits for the drain within a bounded window.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kurier_core::{Clock, Storage};

use crate::{
    error::{DispatchError, Result},
    provider::SmsProvider,
    rate::{RateLimiter, UserLimiter},
    retry::RetryPolicy,
};

/// Configuration for the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum ids claimed per poll.
    pub batch_size: i64,

    /// Number of concurrent sender tasks.
    pub concurrency: usize,

    /// Delay after a non-empty claim before polling again.
    pub poll_interval: Duration,

    /// Delay after an empty claim.
    pub idle_sleep: Duration,

    /// Initial backoff when claiming fails.
    pub db_backoff_min: Duration,

    /// Backoff ceiling when claiming keeps failing.
    pub db_backoff_max: Duration,

    /// Sustained provider call rate.
    pub provider_qps: f64,

    /// Burst capacity of the provider token bucket.
    pub provider_burst: usize,

    /// Per-call deadline on provider sends.
    pub send_timeout: Duration,

    /// Concurrent sends allowed per user; zero disables the cap.
    pub per_user: usize,

    /// Number of users tracked by the per-user limiter.
    pub user_slots: usize,

    /// Backoff policy for transient provider failures.
    pub retry_policy: RetryPolicy,

    /// Age at which a message stuck in `sending` is requeued.
    pub reap_after: Duration,

    /// How often the reaper scans for stuck messages.
    pub reap_interval: Duration,

    /// Drain window for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::DEFAULT_BATCH_SIZE,
            concurrency: crate::DEFAULT_CONCURRENCY,
            poll_interval: Duration::from_millis(200),
            idle_sleep: Duration::from_millis(300),
            db_backoff_min: Duration::from_millis(200),
            db_backoff_max: Duration::from_secs(5),
            provider_qps: crate::DEFAULT_PROVIDER_QPS,
            provider_burst: crate::DEFAULT_PROVIDER_BURST,
            send_timeout: Duration::from_secs(5),
            per_user: 0,
            user_slots: 100,
            retry_policy: RetryPolicy::default(),
            reap_after: Duration::from_secs(600),
            reap_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Messages claimed from the queue.
    pub claimed: u64,
    /// Messages accepted by the provider.
    pub sent: u64,
    /// Messages returned to the queue after a transient failure.
    pub retried: u64,
    /// Messages that reached a terminal failure.
    pub failed: u64,
    /// Credits returned to users.
    pub refunded: u64,
    /// Provider calls currently in flight.
    pub in_flight: u64,
    /// Sender tasks currently running.
    pub active_senders: usize,
}

/// Shared state handed to the poller and sender tasks.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub storage: Arc<Storage>,
    pub provider: Arc<dyn SmsProvider>,
    pub limiter: Arc<RateLimiter>,
    pub user_limiter: Option<Arc<UserLimiter>>,
    pub config: DispatchConfig,
    pub stats: Arc<RwLock<EngineStats>>,
    pub cancel: CancellationToken,
    pub clock: Arc<dyn Clock>,
}

/// Dispatch engine coordinating the poller, sender pool, and reaper.
pub struct DispatchEngine {
    context: WorkerContext,
    handles: Vec<JoinHandle<()>>,
}

impl DispatchEngine {
    /// Creates an engine over the given storage and provider.
    ///
    /// The rate limiter and the per-user limiter are constructed here and
    /// passed to the tasks explicitly; nothing in the engine is process
    /// global.
    pub fn new(
        storage: Arc<Storage>,
        provider: Arc<dyn SmsProvider>,
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.provider_qps, config.provider_burst));
        let user_limiter = UserLimiter::new(config.per_user, config.user_slots).map(Arc::new);

        let context = WorkerContext {
            storage,
            provider,
            limiter,
            user_limiter,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancel: CancellationToken::new(),
            clock,
        };

        Self { context, handles: Vec::new() }
    }

    /// Spawns the poller, sender pool, and reaper.
    ///
    /// Returns immediately; the engine runs until [`Self::shutdown`] or
    /// external cancellation through [`Self::cancellation_token`].
    pub async fn start(&mut self) {
        let config = &self.context.config;
        info!(
            batch_size = config.batch_size,
            concurrency = config.concurrency,
            provider_qps = config.provider_qps,
            "starting dispatch engine"
        );

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let channel_capacity = (config.batch_size.max(1) as usize) * 2;
        let (tx, rx) = mpsc::channel(channel_capacity);
        let rx = Arc::new(Mutex::new(rx));

        {
            let mut stats = self.context.stats.write().await;
            stats.active_senders = config.concurrency;
        }

        for sender_id in 0..config.concurrency {
            let ctx = self.context.clone();
            let rx = rx.clone();
            self.handles.push(tokio::spawn(async move {
                crate::sender::run(sender_id, ctx, rx).await;
            }));
        }

        let poller_ctx = self.context.clone();
        self.handles.push(tokio::spawn(async move {
            crate::poller::run(poller_ctx, tx).await;
        }));

        let reaper_ctx = self.context.clone();
        self.handles.push(tokio::spawn(async move {
            run_reaper(reaper_ctx).await;
        }));

        info!("dispatch engine started");
    }

    /// Returns the token that cancels the whole engine.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }

    /// Returns a snapshot of the engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.context.stats.read().await.clone()
    }

    /// Cancels all tasks and waits for the drain.
    ///
    /// Senders finish their current message, bounded by the send timeout;
    /// the whole drain is bounded by the configured shutdown window.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if tasks are still running when the window
    /// closes.
    pub async fn shutdown(mut self) -> Result<()> {
        let timeout = self.context.config.shutdown_timeout;
        info!(timeout = ?timeout, "shutting down dispatch engine");

        self.context.cancel.cancel();

        let handles = std::mem::take(&mut self.handles);
        let drain = async {
            let mut first_panic = None;
            for handle in handles {
                if let Err(join_error) = handle.await {
                    error!(error = %join_error, "engine task panicked during shutdown");
                    if first_panic.is_none() {
                        first_panic = Some(join_error.to_string());
                    }
                }
            }
            first_panic
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(first_panic) => {
                let mut stats = self.context.stats.write().await;
                stats.active_senders = 0;
                if let Some(message) = first_panic {
                    return Err(DispatchError::WorkerPanic(message));
                }
                info!("dispatch engine stopped");
                Ok(())
            },
            Err(_elapsed) => Err(DispatchError::ShutdownTimeout { timeout }),
        }
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        if !self.handles.is_empty() && !self.context.cancel.is_cancelled() {
            warn!("dispatch engine dropped without shutdown, cancelling tasks");
            self.context.cancel.cancel();
        }
    }
}

/// Rescues messages stranded in `sending` by a crashed worker.
async fn run_reaper(ctx: WorkerContext) {
    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            () = ctx.clock.sleep(ctx.config.reap_interval) => {},
        }

        match ctx.storage.messages.requeue_stuck(ctx.config.reap_after).await {
            Ok(0) => {},
            Ok(requeued) => info!(requeued, "reaper requeued stuck messages"),
            Err(error) => warn!(error = %error, "reaper scan failed"),
        }
    }
}
