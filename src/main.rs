//! kurier SMS gateway service.
//!
//! Main entry point. Initializes tracing, loads configuration, prepares the
//! database, and runs the HTTP API alongside the dispatch engine until a
//! shutdown signal arrives. Startup and shutdown plumbing lives in
//! `kurier_api::bootstrap`.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use kurier_api::{bootstrap, Config};
use kurier_core::{time::RealClock, Storage};
use kurier_dispatch::{DispatchEngine, DummyProvider, SmsProvider};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting kurier SMS gateway");

    let config = Config::load()?;
    info!(
        database_url = %bootstrap::redact_database_url(&config.database_url),
        batch = config.batch,
        concurrency = config.concurrency,
        "configuration loaded"
    );

    let pool = bootstrap::connect_with_retry(&config).await?;
    info!("database connection pool established");

    kurier_core::schema::run_migrations(&pool).await?;
    info!("database migrations completed");

    let storage = Arc::new(Storage::new(pool.clone()));
    let provider: Arc<dyn SmsProvider> = Arc::new(DummyProvider::default());
    let clock = Arc::new(RealClock::new());

    let cancel = CancellationToken::new();

    let mut engine =
        DispatchEngine::new(storage.clone(), provider, config.to_dispatch_config(), clock);
    engine.start().await;

    let addr = bootstrap::listen_addr(&config)?;
    let server_handle = tokio::spawn({
        let storage = storage.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = kurier_api::start_server(storage, &config, addr, cancel).await {
                error!(error = %e, "HTTP server failed");
            }
        }
    });

    info!("kurier is ready to accept messages");

    bootstrap::shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    cancel.cancel();
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "dispatch engine did not drain cleanly");
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(5)) => {
            info!("shutdown grace period expired");
        }
        _ = server_handle => {
            info!("HTTP server stopped");
        }
    }

    pool.close().await;
    info!("database connections closed");

    info!("kurier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,kurier=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
