//! Shared HTTP client for upstream calls.
//!
//! Used by both the synchronous proxy path and the workers replaying
//! deferred requests. The `host` header is always rewritten to the target
//! authority; hop-by-hop headers never cross the proxy.

use crate::error::{GatewayError, GatewayResult};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HOST};
use http::{Method, Request, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Join an application base URL with a request tail and optional query.
pub fn join_url(base_url: &str, tail: &str, query: Option<&str>) -> String {
    let mut url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        tail.trim_start_matches('/')
    );
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl UpstreamClient {
    pub fn new() -> GatewayResult<Self> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| GatewayError::Config(format!("failed to load TLS roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .build();

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(https),
        })
    }

    /// Send one request and return the raw upstream response. Upstream
    /// status codes are not errors here; only transport failures are.
    pub async fn send(
        &self,
        method: Method,
        target: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> GatewayResult<hyper::Response<Incoming>> {
        let uri: Uri = target
            .parse()
            .map_err(|_| GatewayError::Validation(format!("invalid upstream url: {}", target)))?;
        let authority = uri
            .authority()
            .ok_or_else(|| {
                GatewayError::Validation(format!("upstream url missing authority: {}", target))
            })?
            .to_string();

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers.iter() {
            if *name == HOST || is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder.header(HOST, authority.as_str());

        let request = builder
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| GatewayError::Internal(format!("failed to build request: {}", e)))?;

        match timeout(UPSTREAM_TIMEOUT, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(GatewayError::Upstream(format!(
                "upstream request failed: {}",
                e
            ))),
            Err(_) => Err(GatewayError::Upstream(format!(
                "upstream timed out after {}s",
                UPSTREAM_TIMEOUT.as_secs()
            ))),
        }
    }
}
