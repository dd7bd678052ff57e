//! Controllable clock for deterministic timing in unit tests.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use kurier_core::Clock;

/// Clock whose sleeps resolve immediately while recording how long the code
/// under test asked to wait.
///
/// Useful for exercising poller cadence and backoff growth without real
/// delays.
#[derive(Debug, Clone, Default)]
pub struct TestClock {
    slept_micros: Arc<AtomicU64>,
}

impl TestClock {
    /// Creates a new test clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total duration of all sleeps requested so far.
    pub fn total_slept(&self) -> Duration {
        Duration::from_micros(self.slept_micros.load(Ordering::Relaxed))
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        #[allow(clippy::cast_possible_truncation)]
        let micros = duration.as_micros() as u64;
        self.slept_micros.fetch_add(micros, Ordering::Relaxed);
        // Yield once so other tasks make progress between virtual sleeps.
        Box::pin(tokio::task::yield_now())
    }
}
