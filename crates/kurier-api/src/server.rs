//! HTTP server configuration and request routing.
//!
//! Axum server setup with the middleware stack and graceful shutdown.
//! Requests flow through request-id injection, tracing, and timeout
//! enforcement before reaching the handlers.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use kurier_core::Storage;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{handlers, AppState, Config};

/// Creates the Axum router with all routes and middleware.
pub fn create_router(storage: Arc<Storage>, config: &Config) -> Router {
    let state = AppState::new(storage);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/users", post(handlers::create_user))
        .route("/users/{id}/topup", post(handlers::top_up))
        .route("/users/{id}/balance", get(handlers::get_balance))
        .route("/messages", post(handlers::post_message).get(handlers::list_messages))
        .route("/messages/{id}", get(handlers::get_message))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout)))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Middleware injecting an `X-Request-Id` header into all responses.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Starts the HTTP server and serves until the token is cancelled.
///
/// # Errors
///
/// Returns `std::io::Error` if the port cannot be bound or serving fails.
pub async fn start_server(
    storage: Arc<Storage>,
    config: &Config,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(storage, config);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    info!(addr = %actual_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
