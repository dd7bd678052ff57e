//! Core domain models and the transactional storage layer.
//!
//! Provides strongly-typed domain primitives, the error taxonomy, and every
//! database operation of the gateway: enqueue-and-charge, queue claiming,
//! terminal transitions, and the balance ledger. All consistency invariants
//! of the dispatch pipeline live in this crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod schema;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    BalanceTransaction, Message, MessageFilter, MessageId, MessageStatus, SendJob, SendRequest,
    TransactionKind, User, UserId, PRICE_PER_SMS,
};
pub use storage::Storage;
pub use time::Clock;
