//! HTTP request handlers: the proxy path, the status poll, and health.

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::header::{CONTENT_LENGTH, HeaderMap};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info};
use uuid::Uuid;

use crate::apps::AppStore;
use crate::error::{GatewayError, GatewayResult};
use crate::kv::KvClient;
use crate::limiter::{now_millis, Decision, RateLimitEngine};
use crate::queue::{DeferredRequest, Outcome, OutcomeStore, RequestStream};
use crate::response::{HealthResponse, QueuedResponse};
use crate::upstream::{is_hop_by_hop, join_url, UpstreamClient};

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub apps: AppStore,
    pub engine: RateLimitEngine,
    pub stream: RequestStream,
    pub outcomes: OutcomeStore,
    pub upstream: UpstreamClient,
    pub kv: KvClient,
}

/// Admit-or-enqueue proxy path for any method on `/apis/:app_id/*tail`.
///
/// Admitted requests are forwarded inline and the upstream response relayed
/// back. Over-limit requests are never refused: they are serialised onto
/// this node's stream and the client gets a ticket to poll.
pub async fn proxy(
    State(state): State<AppState>,
    Path((app_id, tail)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    mut headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Response> {
    let app = state
        .apps
        .get(&app_id)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("unknown application: {}", app_id)))?;

    match state.engine.decide(&app_id, &app.rate_limit).await? {
        Decision::Admit => {
            debug!(app_id = %app_id, method = %method, "request admitted");
            append_forwarded_for(&mut headers, remote.ip());

            let target = join_url(&app.base_url, &tail, query.as_deref());
            let forward_body = has_body(&method).then(|| body.clone());
            let response = state
                .upstream
                .send(method, &target, &headers, forward_body)
                .await?;
            relay(response).await
        }
        Decision::Deny => {
            let ticket_id = Uuid::new_v4().to_string();
            let mut path = tail;
            if let Some(query) = query {
                path.push('?');
                path.push_str(&query);
            }

            let record = DeferredRequest {
                id: ticket_id.clone(),
                app_id: app_id.clone(),
                method: method.to_string(),
                path,
                headers: headers_to_map(&headers),
                body: has_body(&method).then(|| body.to_vec()),
                enqueued_at: now_millis(),
            };
            state.stream.append(&record).await?;

            info!(app_id = %app_id, ticket = %ticket_id, "request over limit, queued");
            Ok((
                StatusCode::ACCEPTED,
                Json(QueuedResponse::new(ticket_id)),
            )
                .into_response())
        }
    }
}

/// Outcome poll for a deferred-request ticket. Absence of a record is
/// reported as pending; a stored outcome is returned verbatim.
pub async fn status(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
) -> GatewayResult<Json<Outcome>> {
    let outcome = state
        .outcomes
        .get(&ticket_id)
        .await?
        .unwrap_or(Outcome::Pending);
    Ok(Json(outcome))
}

pub async fn health(State(state): State<AppState>) -> Response {
    match state.kv.ping().await {
        Ok(()) => Json(HealthResponse::healthy(true)).into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse::unhealthy(false)),
        )
            .into_response(),
    }
}

fn has_body(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD
}

/// Append the caller to `x-forwarded-for`, preserving any existing chain.
fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let addr = client.to_string();
    let chain = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, addr),
        None => addr,
    };
    if let Ok(value) = chain.parse() {
        headers.insert("x-forwarded-for", value);
    }
}

/// Headers into the stored string map; non-UTF-8 values are dropped.
fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Relay an upstream response: same status, headers minus hop-by-hop, and
/// the payload bytes passed through unchanged.
async fn relay(response: hyper::Response<Incoming>) -> GatewayResult<Response> {
    let (parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| GatewayError::Upstream(format!("failed to read upstream body: {}", e)))?
        .to_bytes();

    let mut builder = axum::http::Response::builder().status(parts.status);
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name) || *name == CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from(bytes))
        .map_err(|e| GatewayError::Internal(format!("failed to build response: {}", e)))
}
