//! Scripted provider for engine tests.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use kurier_dispatch::{ProviderError, SmsProvider};
use tokio::sync::Mutex;

/// Provider whose outcomes are scripted in advance.
///
/// Scripted outcomes are consumed in order; once the script is exhausted,
/// every further call succeeds with a sequential id. Records every call for
/// assertions.
pub struct MockProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    calls: Mutex<Vec<(String, String)>>,
    sequence: AtomicUsize,
    latency: Duration,
}

impl MockProvider {
    /// Provider that succeeds on every call.
    pub fn always_ok() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            sequence: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Provider that takes `latency` before answering each call.
    pub fn slow(latency: Duration) -> Self {
        Self { latency, ..Self::always_ok() }
    }

    /// Provider that fails the first `failures` calls, then succeeds.
    pub fn failing_times(failures: usize) -> Self {
        let provider = Self::always_ok();
        let mut script = VecDeque::new();
        for _ in 0..failures {
            script.push_back(Err(ProviderError("provider_temporary_error".to_string())));
        }
        *provider.script.try_lock().expect("unshared at construction") = script;
        provider
    }

    /// Appends one scripted outcome.
    pub async fn push_outcome(&self, outcome: Result<String, ProviderError>) {
        self.script.lock().await.push_back(outcome);
    }

    /// Number of calls made so far.
    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// All `(to, body)` pairs seen so far.
    pub async fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl SmsProvider for MockProvider {
    async fn send(&self, to: &str, body: &str) -> Result<String, ProviderError> {
        self.calls.lock().await.push((to.to_string(), body.to_string()));

        if self.latency > Duration::ZERO {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(outcome) = self.script.lock().await.pop_front() {
            return outcome;
        }

        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        Ok(format!("prov-mock-{n}"))
    }
}
