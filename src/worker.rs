//! Deferred-request worker.
//!
//! Each worker is a task in the node's consumer group. It reads small
//! batches, re-checks the limit against the application's current config
//! (config edits take effect per request), executes the upstream call, and
//! records the outcome under the ticket key before acknowledging. A denied
//! record goes back to the tail of the stream with a fresh timestamp.
//! Upstream failures are terminal; the first outcome stands.

use crate::apps::AppStore;
use crate::error::{GatewayError, GatewayResult};
use crate::kv::KvClient;
use crate::limiter::{now_millis, Decision, RateLimitEngine};
use crate::queue::{DeferredRequest, Outcome, OutcomeStore, RequestStream, StreamEntry};
use crate::upstream::{join_url, UpstreamClient};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub(crate) const BATCH_SIZE: usize = 3;
pub(crate) const BLOCK_MS: usize = 5_000;

/// Everything a worker needs, shared across the pool.
pub struct WorkerContext {
    pub kv: KvClient,
    pub apps: AppStore,
    pub engine: RateLimitEngine,
    pub outcomes: OutcomeStore,
    pub upstream: UpstreamClient,
}

enum Processed {
    Completed(u16),
    Requeued,
}

/// Consumer loop; returns when the stop signal fires.
pub async fn run(
    ctx: Arc<WorkerContext>,
    stream: RequestStream,
    consumer: String,
    mut stop: watch::Receiver<bool>,
) {
    info!(consumer = %consumer, "worker started");

    loop {
        if *stop.borrow() {
            break;
        }

        let batch = tokio::select! {
            result = stream.read_batch(&consumer, BATCH_SIZE, BLOCK_MS) => match result {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(consumer = %consumer, error = %e, "batch read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            },
            _ = stop.changed() => break,
        };

        for entry in batch {
            process_entry(&ctx, &stream, &entry).await;
        }
    }

    info!(consumer = %consumer, "worker stopped");
}

async fn process_entry(ctx: &WorkerContext, stream: &RequestStream, entry: &StreamEntry) {
    let request: DeferredRequest = match serde_json::from_str(&entry.payload) {
        Ok(request) => request,
        Err(e) => {
            // No ticket to record under; drain the poison entry.
            error!(entry_id = %entry.id, error = %e, "unparseable stream entry, dropping");
            ack(stream, &entry.id).await;
            return;
        }
    };

    match execute(ctx, &request).await {
        Ok(Processed::Completed(status_code)) => {
            let outcome = Outcome::Completed { status_code };
            if record(ctx, &request.id, &outcome).await {
                debug!(ticket = %request.id, status_code, "deferred request completed");
                ack(stream, &entry.id).await;
            }
        }
        Ok(Processed::Requeued) => {
            let requeued = DeferredRequest {
                enqueued_at: now_millis(),
                ..request.clone()
            };
            match stream.append(&requeued).await {
                Ok(_) => {
                    debug!(ticket = %request.id, "still over limit, re-queued");
                    ack(stream, &entry.id).await;
                }
                Err(e) => {
                    // Leave the original entry pending so the record is not
                    // lost; it will be retried as pending work.
                    warn!(ticket = %request.id, error = %e, "re-queue failed");
                }
            }
        }
        Err(e) => {
            let outcome = Outcome::Failed {
                error: e.to_string(),
            };
            warn!(ticket = %request.id, error = %e, "deferred request failed");
            if record(ctx, &request.id, &outcome).await {
                ack(stream, &entry.id).await;
            }
        }
    }
}

async fn execute(ctx: &WorkerContext, request: &DeferredRequest) -> GatewayResult<Processed> {
    let app = ctx
        .apps
        .get(&request.app_id)
        .await?
        .ok_or_else(|| {
            GatewayError::NotFound(format!("application no longer exists: {}", request.app_id))
        })?;

    match ctx.engine.decide(&request.app_id, &app.rate_limit).await? {
        Decision::Deny => Ok(Processed::Requeued),
        Decision::Admit => {
            let method: Method = request.method.parse().map_err(|_| {
                GatewayError::Validation(format!("invalid stored method: {}", request.method))
            })?;
            let target = join_url(&app.base_url, &request.path, None);
            let headers = headers_from_map(&request.headers);
            let body = request.body.as_ref().map(|b| Bytes::from(b.clone()));

            let response = ctx.upstream.send(method, &target, &headers, body).await?;
            Ok(Processed::Completed(response.status().as_u16()))
        }
    }
}

/// Stored headers back into a typed map; unrepresentable entries are skipped.
fn headers_from_map(map: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in map {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping unrepresentable stored header"),
        }
    }
    headers
}

async fn record(ctx: &WorkerContext, ticket_id: &str, outcome: &Outcome) -> bool {
    match ctx.outcomes.record(ticket_id, outcome).await {
        Ok(()) => true,
        Err(e) => {
            // Keep the entry pending rather than ack a ticket with no
            // outcome; the client would poll "pending" forever otherwise.
            error!(ticket = %ticket_id, error = %e, "failed to record outcome");
            false
        }
    }
}

async fn ack(stream: &RequestStream, entry_id: &str) {
    if let Err(e) = stream.ack(entry_id).await {
        warn!(entry_id = %entry_id, error = %e, "acknowledge failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_from_map_round_trip() {
        let map = HashMap::from([
            ("content-type".to_string(), "application/json".to_string()),
            ("authorization".to_string(), "Bearer token".to_string()),
        ]);
        let headers = headers_from_map(&map);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["content-type"], "application/json");
    }

    #[test]
    fn test_headers_from_map_skips_invalid_names() {
        let map = HashMap::from([
            ("bad header name".to_string(), "x".to_string()),
            ("x-ok".to_string(), "1".to_string()),
        ]);
        let headers = headers_from_map(&map);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-ok"));
    }
}
