use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::GatewayError;

/// Gate the API surface on the presence of an API key. Validation against
/// the user registry happens in the external auth subsystem; the gateway
/// only refuses keyless requests outright.
pub async fn require_api_key(request: Request, next: Next) -> Result<Response, GatewayError> {
    if request.headers().get("x-api-key").is_none() {
        return Err(GatewayError::MissingApiKey);
    }
    Ok(next.run(request).await)
}

/// Logging middleware that tracks request duration and outcome
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    if status.is_server_error() {
        warn!(
            method = %method,
            uri = %uri,
            status = %status.as_u16(),
            duration_ms = duration.as_millis(),
            "Request completed with error"
        );
    } else {
        info!(
            method = %method,
            uri = %uri,
            status = %status.as_u16(),
            duration_ms = duration.as_millis(),
            "Request completed"
        );
    }

    response
}
