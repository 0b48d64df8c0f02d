use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::handlers::{self, AppState};
use crate::middleware;
use axum::middleware::from_fn;
use axum::routing::{any, get};
use axum::Router;
use std::net::SocketAddr;
use tracing::{error, info};

/// Assemble the gateway router. The status route is registered alongside the
/// catch-all app route; the router prefers the static `status` segment, so
/// ticket polls never reach the proxy handler.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/apis/status/:ticket_id", get(handlers::status))
        .route("/apis/:app_id/*tail", any(handlers::proxy))
        .route_layer(from_fn(middleware::require_api_key));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .layer(from_fn(middleware::logging_middleware))
        .with_state(state)
}

/// Serve until the shutdown signal fires and in-flight requests drain.
pub async fn run(config: &Config, state: AppState) -> GatewayResult<()> {
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to bind {}: {}", addr, e)))?;

    info!(addr = %addr, "HTTP server listening");

    let router = build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| GatewayError::Internal(format!("server error: {}", e)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
