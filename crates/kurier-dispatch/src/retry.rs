//! Retry policy for failed provider calls.
//!
//! Exponential backoff keyed off the message's claim counter, with jitter to
//! spread retry storms and a hard attempts cap that escalates the message to
//! a refunded permanent failure.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy applied by sender tasks.
///
/// The delay for a message that has been claimed `attempts` times is
/// `base_delay × 2^min(attempts − 1, exponent_cap)`, jittered and capped at
/// `max_delay`. Once `attempts` reaches `max_attempts` the message is given
/// up and refunded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of claims before giving up (including the first).
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Upper bound on any computed delay.
    pub max_delay: Duration,

    /// Exponent is clamped here so the doubling stops growing.
    pub exponent_cap: u32,

    /// Jitter fraction (0.0 to 1.0) applied as ±percentage.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(900),
            exponent_cap: 5,
            jitter_factor: 0.2,
        }
    }
}

/// Outcome of a retry decision for one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the message to the queue after the given delay.
    Retry {
        /// How long until the message is eligible for claiming again.
        delay: Duration,
    },
    /// Stop retrying; the message escalates to a refunded failure.
    GiveUp,
}

impl RetryPolicy {
    /// Decides what to do with a message that failed on its n-th claim.
    ///
    /// `attempts` is the claim counter maintained by the storage layer,
    /// already including the claim that just failed.
    pub fn decide(&self, attempts: i32) -> RetryDecision {
        #[allow(clippy::cast_sign_loss)]
        let attempts = attempts.max(1) as u32;
        if attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let exponent = (attempts - 1).min(self.exponent_cap);
        let multiplier = 2_u32.saturating_pow(exponent);
        let delay = self.base_delay.saturating_mul(multiplier).min(self.max_delay);

        RetryDecision::Retry { delay: apply_jitter(delay, self.jitter_factor).min(self.max_delay) }
    }
}

/// Randomizes a duration by ±`jitter_factor` to avoid thundering herds.
pub(crate) fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
