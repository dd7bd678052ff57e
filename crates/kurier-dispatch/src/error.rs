//! Error types for dispatch operations.
//!
//! Provider failures are wrapped into [`DispatchError`] so the sender can
//! classify them before consulting the retry policy; per-message failures
//! are then resolved in-band by state transitions and never propagate out
//! of the sender tasks. The lifecycle variants cover engine shutdown.

use std::time::Duration;

use thiserror::Error;

use crate::provider::ProviderError;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error types for the dispatch engine.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The provider rejected or failed the call.
    #[error("provider error: {message}")]
    Provider {
        /// Opaque provider error message.
        message: String,
    },

    /// The per-send deadline elapsed before the provider answered.
    #[error("send timed out after {timeout:?}")]
    SendTimeout {
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// Workers did not drain within the shutdown window.
    #[error("shutdown timed out after {timeout:?}, some tasks may still be running")]
    ShutdownTimeout {
        /// The drain window that was exceeded.
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker task panicked: {0}")]
    WorkerPanic(String),
}

impl DispatchError {
    /// Whether the failed message should go back to the queue.
    ///
    /// Provider errors are opaque, so every failed or timed-out call is
    /// classified transient until a future version learns to distinguish
    /// permanent rejections; a non-retryable classification here sends the
    /// message straight to the refunded-failure path.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { .. } | Self::SendTimeout { .. })
    }
}

impl From<ProviderError> for DispatchError {
    fn from(err: ProviderError) -> Self {
        Self::Provider { message: err.0 }
    }
}
