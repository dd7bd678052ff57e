//! HTTP surface of the gateway.
//!
//! Converts external calls into core-service invocations; never touches the
//! database directly. Also hosts the layered configuration that wires the
//! binary, the API server, and the dispatch engine together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use kurier_core::Storage;

pub mod bootstrap;
pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared state handed to request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Storage layer providing every core-service operation.
    pub storage: Arc<Storage>,
}

impl AppState {
    /// Creates the handler state.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}
