//! Error handling for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt;

use crate::response::ErrorBody;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur in the gateway service
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Configuration error (malformed rate-limit config, bad environment)
    Config(String),
    /// Invalid request or request payload
    Validation(String),
    /// Unknown application or resource
    NotFound(String),
    /// KV store operation error
    Store(String),
    /// KV cluster redirect that survived the bounded retry
    StoreRedirect(String),
    /// Upstream call failed before a status code was obtained
    Upstream(String),
    /// Serialization/deserialization error
    Serialization(String),
    /// Internal server error
    Internal(String),
    /// Missing API key in request headers
    MissingApiKey,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            GatewayError::Validation(msg) => write!(f, "Validation error: {}", msg),
            GatewayError::NotFound(msg) => write!(f, "Not found: {}", msg),
            GatewayError::Store(msg) => write!(f, "Store error: {}", msg),
            GatewayError::StoreRedirect(msg) => write!(f, "Store redirect error: {}", msg),
            GatewayError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            GatewayError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "Internal error: {}", msg),
            GatewayError::MissingApiKey => write!(f, "Missing API key in request headers"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<redis::RedisError> for GatewayError {
    fn from(error: redis::RedisError) -> Self {
        if crate::kv::is_redirect(&error) {
            GatewayError::StoreRedirect(error.to_string())
        } else {
            GatewayError::Store(error.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(error: serde_json::Error) -> Self {
        GatewayError::Serialization(error.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Store internals never reach the client; the original cause goes to
        // the logs.
        let (status, message) = match &self {
            GatewayError::Config(msg) | GatewayError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            GatewayError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            GatewayError::MissingApiKey => (StatusCode::UNAUTHORIZED, self.to_string()),
            GatewayError::Upstream(msg) => {
                tracing::error!(error = %msg, "upstream request failed");
                (StatusCode::BAD_GATEWAY, "Upstream request failed".to_string())
            }
            GatewayError::Store(msg)
            | GatewayError::StoreRedirect(msg)
            | GatewayError::Serialization(msg)
            | GatewayError::Internal(msg) => {
                tracing::error!(error = %msg, "internal gateway error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(ErrorBody::new(message))).into_response()
    }
}
