use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Body of the `202 Accepted` reply for an enqueued request.
#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub status: String,
    pub data: QueuedData,
}

#[derive(Debug, Serialize)]
pub struct QueuedData {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub message: String,
}

impl QueuedResponse {
    pub fn new(request_id: String) -> Self {
        Self {
            status: "queued".to_string(),
            data: QueuedData {
                request_id,
                message: "Request queued for deferred execution".to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: String) -> Self {
        Self {
            status: "error".to_string(),
            message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub redis_connected: bool,
}

impl HealthResponse {
    pub fn healthy(redis_connected: bool) -> Self {
        Self::build("healthy", redis_connected)
    }

    pub fn unhealthy(redis_connected: bool) -> Self {
        Self::build("unhealthy", redis_connected)
    }

    fn build(status: &str, redis_connected: bool) -> Self {
        Self {
            status: status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            redis_connected,
        }
    }
}
