//! The SMS provider capability.
//!
//! One operation: submit a message, get back the provider's id for it. The
//! engine enforces the per-call deadline; implementations only need to be
//! cancel-safe. Every returned error is treated as transient by the caller.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

/// Opaque provider failure.
///
/// Callers classify all provider errors as transient and retry through the
/// queue; a future version may distinguish permanent rejections.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

/// Capability consumed by the dispatch engine.
#[async_trait]
pub trait SmsProvider: Send + Sync {
    /// Submits one message and returns the provider-assigned id.
    async fn send(&self, to: &str, body: &str) -> Result<String, ProviderError>;
}

/// Simulated provider for local runs and load testing.
///
/// Sleeps for a fixed latency, then fails a configurable fraction of calls
/// with a transient error.
#[derive(Debug, Clone)]
pub struct DummyProvider {
    latency: Duration,
    failure_rate: f64,
}

impl DummyProvider {
    /// Creates a dummy provider with the given latency and failure rate.
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self { latency, failure_rate: failure_rate.clamp(0.0, 1.0) }
    }
}

impl Default for DummyProvider {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), 0.03)
    }
}

#[async_trait]
impl SmsProvider for DummyProvider {
    async fn send(&self, _to: &str, _body: &str) -> Result<String, ProviderError> {
        tokio::time::sleep(self.latency).await;

        let (failed, suffix) = {
            let mut rng = rand::rng();
            let failed = rng.random_range(0.0..1.0) < self.failure_rate;
            let suffix: String = (0..12)
                .map(|_| {
                    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
                    let idx = rng.random_range(0..ALPHABET.len());
                    ALPHABET[idx] as char
                })
                .collect();
            (failed, suffix)
        };

        if failed {
            return Err(ProviderError("provider_temporary_error".to_string()));
        }
        Ok(format!("prov-{suffix}"))
    }
}
