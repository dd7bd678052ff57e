//! Rate limiting for provider calls.
//!
//! A process-wide token bucket bounds the average call rate and burst size,
//! and an optional per-user limiter caps how many messages of one user are
//! in flight at once. Both are built on `tokio::sync::Semaphore`; every wait
//! observes the engine's cancellation token.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use kurier_core::UserId;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Process-wide token bucket.
///
/// Starts full at `burst` tokens and refills at `qps` tokens per second,
/// never exceeding `burst`. Tokens are consumed one per provider call.
pub struct RateLimiter {
    permits: Semaphore,
    qps: f64,
    burst: usize,
    refill: Mutex<RefillState>,
}

struct RefillState {
    last: Instant,
    carry: f64,
}

impl RateLimiter {
    /// Creates a bucket sustaining `qps` calls per second with `burst`
    /// capacity. A `qps` of zero or below disables pacing entirely.
    pub fn new(qps: f64, burst: usize) -> Self {
        let burst = burst.max(1);
        Self {
            permits: Semaphore::new(burst),
            qps,
            burst,
            refill: Mutex::new(RefillState { last: Instant::now(), carry: 0.0 }),
        }
    }

    /// Takes one token, waiting for a refill when the bucket is empty.
    ///
    /// Returns `false` when cancelled during the wait.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        if self.qps <= 0.0 {
            return !cancel.is_cancelled();
        }

        loop {
            self.refill().await;

            if let Ok(permit) = self.permits.try_acquire() {
                permit.forget();
                return true;
            }

            // Empty bucket: wait roughly one token interval before looking
            // again. Coarse pacing is fine; the semaphore count is exact.
            let token_interval = Duration::from_secs_f64(1.0 / self.qps);
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(token_interval) => {},
            }
        }
    }

    /// Adds the tokens accrued since the last refill, capped at `burst`.
    async fn refill(&self) {
        let mut state = self.refill.lock().await;

        let accrued = state.last.elapsed().as_secs_f64() * self.qps + state.carry;
        let whole = accrued.floor();
        if whole < 1.0 {
            return;
        }

        state.last = Instant::now();
        state.carry = accrued - whole;

        let room = self.burst.saturating_sub(self.permits.available_permits());
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let to_add = (whole as usize).min(room);
        if to_add > 0 {
            self.permits.add_permits(to_add);
        }
    }
}

/// Per-user concurrency cap.
///
/// Keeps a bounded map of semaphores keyed by user id; each user may have at
/// most `per_user` messages in flight in this process. When the map is full,
/// idle entries are evicted; an entry with in-flight permits is never
/// evicted, so the cap holds exactly where it matters.
pub struct UserLimiter {
    per_user: usize,
    max_slots: usize,
    slots: Mutex<HashMap<UserId, Arc<Semaphore>>>,
}

impl UserLimiter {
    /// Creates a limiter granting `per_user` concurrent sends per user and
    /// tracking up to `max_slots` users. Returns `None` when `per_user` is
    /// zero, which disables the cap.
    pub fn new(per_user: usize, max_slots: usize) -> Option<Self> {
        if per_user == 0 {
            return None;
        }
        Some(Self { per_user, max_slots: max_slots.max(1), slots: Mutex::new(HashMap::new()) })
    }

    /// Takes a permit for the given user, waiting when the user is at cap.
    ///
    /// Returns `None` when cancelled during the wait.
    pub async fn acquire(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        let semaphore = {
            let mut slots = self.slots.lock().await;

            if slots.len() >= self.max_slots && !slots.contains_key(&user_id) {
                // Only entries nobody holds a permit on are evictable.
                slots.retain(|_, sem| Arc::strong_count(sem) > 1);
            }

            slots
                .entry(user_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_user)))
                .clone()
        };

        tokio::select! {
            () = cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        }
    }
}
