//! Message dispatch engine with durability guarantees.
//!
//! Drains the queued-message table concurrently against a rate-limited SMS
//! provider. Uses PostgreSQL `FOR UPDATE SKIP LOCKED` for lock-free claim
//! distribution, so any number of worker processes can run side by side.
//!
//! # Engine Architecture
//!
//! ```text
//!                  ┌─────────────────────────────────────────┐
//!                  │               PostgreSQL                │
//!                  │  ┌───────────────────────────────────┐  │
//!                  │  │          messages table           │  │
//!                  │  │  ┌─────────────────────────────┐  │  │
//!                  │  │  │   FOR UPDATE SKIP LOCKED    │  │  │
//!                  │  │  │  (lock-free claim batches)  │  │  │
//!                  │  │  └─────────────────────────────┘  │  │
//!                  │  └───────────────────────────────────┘  │
//!                  └─────────────────────────────────────────┘
//!                                      │
//!                                claim(batch)
//!                                      │
//!                                ┌───────────┐
//!                                │  Poller   │
//!                                └───────────┘
//!                                      │
//!                          bounded channel (2 × batch)
//!                                      │
//!                    ┌─────────────────┼─────────────────┐
//!                    ▼                 ▼                 ▼
//!             ┌────────────┐   ┌────────────┐   ┌────────────┐
//!             │  Sender 1  │   │  Sender 2  │   │  Sender N  │
//!             └────────────┘   └────────────┘   └────────────┘
//!                    │                 │                 │
//!                    └────── shared token bucket ────────┘
//!                                      │
//!                                 SMS provider
//! ```
//!
//! Key properties:
//! - **At-most-one claim**: SKIP LOCKED guarantees no two claimers ever
//!   receive the same message id
//! - **Bounded concurrency**: the channel plus the fixed sender pool are
//!   the only concurrency; the token bucket paces provider calls
//! - **Graceful drain**: on cancellation the poller closes the channel and
//!   senders finish what is in flight before exiting

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod error;
mod poller;
pub mod provider;
pub mod rate;
pub mod retry;
mod sender;

pub use engine::{DispatchConfig, DispatchEngine, EngineStats};
pub use error::{DispatchError, Result};
pub use provider::{DummyProvider, ProviderError, SmsProvider};
pub use rate::{RateLimiter, UserLimiter};
pub use retry::{RetryDecision, RetryPolicy};

/// Default number of messages claimed per poll.
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Default number of concurrent sender tasks.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Default sustained provider rate in calls per second.
pub const DEFAULT_PROVIDER_QPS: f64 = 500.0;

/// Default burst capacity of the provider token bucket.
pub const DEFAULT_PROVIDER_BURST: usize = 1000;
