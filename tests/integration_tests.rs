//! Integration tests.
//!
//! Tests marked `#[ignore]` need a running Redis (REDIS_URL, default
//! redis://127.0.0.1:6379) and are excluded from the default run:
//!
//!     cargo test -- --ignored

use axum::body::Body;
use axum::http::{Request, StatusCode};
use limitgate::apps::{App, AppStore};
use limitgate::config::Config;
use limitgate::handlers::AppState;
use limitgate::kv::KvClient;
use limitgate::limiter::{Decision, RateLimitConfig, RateLimitEngine};
use limitgate::manager::{NodeId, NodeIdAllocator};
use limitgate::queue::{DeferredRequest, Outcome, OutcomeStore, RequestStream};
use limitgate::server;
use limitgate::upstream::UpstreamClient;
use limitgate::worker::{self, WorkerContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

fn test_config() -> Config {
    let mut config = Config::default();
    if let Ok(url) = std::env::var("REDIS_URL") {
        config.redis_url = url;
    }
    config
}

fn test_kv() -> KvClient {
    KvClient::new(&test_config()).unwrap()
}

fn test_engine(kv: KvClient) -> RateLimitEngine {
    // Short retry delay so redirect handling never stalls a test run.
    RateLimitEngine::new(kv, 3, Duration::from_millis(50))
}

fn test_state() -> AppState {
    let kv = test_kv();
    AppState {
        apps: AppStore::new(kv.clone()),
        engine: test_engine(kv.clone()),
        stream: RequestStream::new(kv.clone(), "node:test"),
        outcomes: OutcomeStore::new(kv.clone()),
        upstream: UpstreamClient::new().unwrap(),
        kv,
    }
}

fn unique_app_id() -> String {
    format!("test-{}", Uuid::new_v4())
}

#[tokio::test]
async fn test_missing_api_key_is_rejected() {
    let app = server::build_router(test_state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/apis/some-app/users")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // The key gate runs before any handler, so no Redis is touched.
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore]
async fn test_fixed_window_caps_admits() {
    let kv = test_kv();
    let engine = test_engine(kv);
    let app_id = unique_app_id();
    let config = RateLimitConfig::FixedWindow {
        window: 60,
        requests: 3,
    };

    let mut admitted = 0;
    let mut denied = 0;
    for _ in 0..5 {
        match engine.decide(&app_id, &config).await.unwrap() {
            Decision::Admit => admitted += 1,
            Decision::Deny => denied += 1,
        }
    }
    assert_eq!(admitted, 3);
    assert_eq!(denied, 2);
}

#[tokio::test]
#[ignore]
async fn test_token_bucket_burst_then_refill() {
    let kv = test_kv();
    let engine = test_engine(kv);
    let app_id = unique_app_id();
    let config = RateLimitConfig::TokenBucket {
        window: 60,
        requests: 10,
        burst: Some(5),
        refill_rate: Some(2.0),
    };

    let mut admitted = 0;
    for _ in 0..8 {
        if engine.decide(&app_id, &config).await.unwrap() == Decision::Admit {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);

    // 1.6s at 2 tokens/sec refills at least 3 whole tokens.
    tokio::time::sleep(Duration::from_millis(1600)).await;
    for _ in 0..3 {
        assert_eq!(
            engine.decide(&app_id, &config).await.unwrap(),
            Decision::Admit
        );
    }
}

#[tokio::test]
#[ignore]
async fn test_sliding_log_is_exact() {
    let kv = test_kv();
    let engine = test_engine(kv);
    let app_id = unique_app_id();
    let config = RateLimitConfig::SlidingLog {
        window: 2,
        requests: 2,
    };

    let mut admitted = 0;
    for _ in 0..4 {
        if engine.decide(&app_id, &config).await.unwrap() == Decision::Admit {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 2);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(
        engine.decide(&app_id, &config).await.unwrap(),
        Decision::Admit
    );
    assert_eq!(
        engine.decide(&app_id, &config).await.unwrap(),
        Decision::Admit
    );
}

#[tokio::test]
#[ignore]
async fn test_concurrent_admits_respect_cap() {
    let kv = test_kv();
    let app_id = unique_app_id();
    let config = RateLimitConfig::FixedWindow {
        window: 60,
        requests: 10,
    };

    let mut handles = Vec::new();
    for _ in 0..30 {
        let engine = test_engine(kv.clone());
        let app_id = app_id.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            engine.decide(&app_id, &config).await.unwrap()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() == Decision::Admit {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[tokio::test]
#[ignore]
async fn test_stream_lifecycle_and_trim_safety() {
    let kv = test_kv();
    let node_id = format!("node:test-{}", Uuid::new_v4());
    let stream = RequestStream::new(kv, &node_id);
    stream.create_group().await.unwrap();

    let mut ids = Vec::new();
    for n in 0..5 {
        let record = DeferredRequest {
            id: format!("ticket-{}", n),
            app_id: "app".to_string(),
            method: "GET".to_string(),
            path: "users".to_string(),
            headers: HashMap::new(),
            body: None,
            enqueued_at: 0,
        };
        ids.push(stream.append(&record).await.unwrap());
    }
    assert_eq!(stream.len().await.unwrap(), 5);

    // Deliver the first two entries to a consumer; they become pending.
    let batch = stream.read_batch("c1", 2, 100).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(
        stream.oldest_pending_id().await.unwrap().as_deref(),
        Some(ids[0].as_str())
    );

    // Acknowledge the first; pending floor advances to the second.
    stream.ack(&ids[0]).await.unwrap();
    assert_eq!(
        stream.oldest_pending_id().await.unwrap().as_deref(),
        Some(ids[1].as_str())
    );

    // Trimming to the pending floor drops only acknowledged history.
    stream.trim_to_min_id(&ids[1]).await.unwrap();
    assert_eq!(stream.len().await.unwrap(), 4);
    assert_eq!(
        stream.oldest_pending_id().await.unwrap().as_deref(),
        Some(ids[1].as_str())
    );
}

#[tokio::test]
#[ignore]
async fn test_outcome_roundtrip_and_monotonicity() {
    let kv = test_kv();
    let outcomes = OutcomeStore::new(kv);
    let ticket = Uuid::new_v4().to_string();

    assert_eq!(outcomes.get(&ticket).await.unwrap(), None);

    let outcome = Outcome::Completed { status_code: 201 };
    outcomes.record(&ticket, &outcome).await.unwrap();

    assert_eq!(outcomes.get(&ticket).await.unwrap(), Some(outcome.clone()));
    // Re-reads keep returning the recorded value.
    assert_eq!(outcomes.get(&ticket).await.unwrap(), Some(outcome));
}

#[tokio::test]
#[ignore]
async fn test_node_id_ceiling_and_recycling() {
    let kv = test_kv();
    kv.delete("server:pool").await.unwrap();
    kv.delete("server:counter").await.unwrap();

    let allocator = NodeIdAllocator::new(kv.clone());

    for n in 1..=100 {
        assert_eq!(
            allocator.acquire().await.unwrap(),
            NodeId::from(format!("node:{}", n))
        );
    }

    let err = allocator.acquire().await.unwrap_err();
    assert!(err.to_string().contains("Maximum number of node IDs reached"));

    // One node releases; the next start reuses its id.
    allocator.release(&NodeId::from("node:7")).await.unwrap();
    assert!(kv.set_contains("server:pool", "node:7").await.unwrap());
    assert_eq!(allocator.acquire().await.unwrap(), NodeId::from("node:7"));
}

/// End-to-end deferred execution: enqueue a record, run a worker against a
/// local upstream stub, and poll the outcome.
#[tokio::test]
#[ignore]
async fn test_worker_drains_queue_and_records_outcome() {
    // Upstream stub on an ephemeral port.
    let upstream_router =
        axum::Router::new().route("/ping", axum::routing::get(|| async { "pong" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upstream_router).await.unwrap();
    });

    let kv = test_kv();
    let app_id = unique_app_id();
    let apps = AppStore::new(kv.clone());
    apps.save(&App {
        id: app_id.clone(),
        name: "stub".to_string(),
        base_url: format!("http://{}", upstream_addr),
        rate_limit: RateLimitConfig::FixedWindow {
            window: 60,
            requests: 100,
        },
        user_id: None,
    })
    .await
    .unwrap();

    let node_id = format!("node:test-{}", Uuid::new_v4());
    let stream = RequestStream::new(kv.clone(), &node_id);
    stream.create_group().await.unwrap();

    let ticket = Uuid::new_v4().to_string();
    stream
        .append(&DeferredRequest {
            id: ticket.clone(),
            app_id: app_id.clone(),
            method: "GET".to_string(),
            path: "ping".to_string(),
            headers: HashMap::new(),
            body: None,
            enqueued_at: 0,
        })
        .await
        .unwrap();

    let outcomes = OutcomeStore::new(kv.clone());
    let ctx = Arc::new(WorkerContext {
        kv: kv.clone(),
        apps,
        engine: test_engine(kv.clone()),
        outcomes: outcomes.clone(),
        upstream: UpstreamClient::new().unwrap(),
    });

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let consumer = format!("{}:worker:test", node_id);
    let worker_handle = tokio::spawn(worker::run(ctx, stream.clone(), consumer, stop_rx));

    // The worker blocks up to 5s per read; give it time to pick the entry up.
    let mut outcome = None;
    for _ in 0..50 {
        if let Some(found) = outcomes.get(&ticket).await.unwrap() {
            outcome = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = stop_tx.send(true);
    worker_handle.await.unwrap();

    assert_eq!(outcome, Some(Outcome::Completed { status_code: 200 }));
    // The entry was acknowledged, so nothing is left pending.
    assert_eq!(stream.oldest_pending_id().await.unwrap(), None);
}

/// Admit-or-enqueue through the real router: with a cap of 3, five requests
/// yield three relayed upstream responses and two tickets.
#[tokio::test]
#[ignore]
async fn test_proxy_admits_then_enqueues() {
    use axum::extract::ConnectInfo;
    use std::net::SocketAddr;

    let upstream_router = axum::Router::new().route(
        "/ping",
        axum::routing::get(|| async { axum::Json(serde_json::json!({"ok": true})) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upstream_router).await.unwrap();
    });

    let state = test_state();
    let app_id = unique_app_id();
    state
        .apps
        .save(&App {
            id: app_id.clone(),
            name: "stub".to_string(),
            base_url: format!("http://{}", upstream_addr),
            rate_limit: RateLimitConfig::FixedWindow {
                window: 60,
                requests: 3,
            },
            user_id: None,
        })
        .await
        .unwrap();

    let router = server::build_router(state.clone());
    let mut relayed = 0;
    let mut queued = 0;
    for _ in 0..5 {
        let mut request = Request::builder()
            .uri(format!("/apis/{}/ping", app_id))
            .header("x-api-key", "test-key")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

        let response = router.clone().oneshot(request).await.unwrap();
        match response.status() {
            StatusCode::OK => {
                let bytes = axum::body::to_bytes(response.into_body(), 1024)
                    .await
                    .unwrap();
                let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
                assert_eq!(body["ok"], true);
                relayed += 1;
            }
            StatusCode::ACCEPTED => {
                let bytes = axum::body::to_bytes(response.into_body(), 1024)
                    .await
                    .unwrap();
                let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
                assert_eq!(body["status"], "queued");
                let ticket = body["data"]["requestId"].as_str().unwrap();

                // Nothing recorded yet: the ticket polls as pending.
                let mut poll = Request::builder()
                    .uri(format!("/apis/status/{}", ticket))
                    .header("x-api-key", "test-key")
                    .body(Body::empty())
                    .unwrap();
                poll.extensions_mut()
                    .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
                let poll_response = router.clone().oneshot(poll).await.unwrap();
                assert_eq!(poll_response.status(), StatusCode::OK);
                let bytes = axum::body::to_bytes(poll_response.into_body(), 1024)
                    .await
                    .unwrap();
                let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
                assert_eq!(body["status"], "pending");
                queued += 1;
            }
            other => panic!("unexpected status: {}", other),
        }
    }

    assert_eq!(relayed, 3);
    assert_eq!(queued, 2);
    assert!(state.stream.len().await.unwrap() >= 2);
}

#[tokio::test]
#[ignore]
async fn test_proxy_deleted_app_is_404() {
    use axum::extract::ConnectInfo;
    use std::net::SocketAddr;

    let state = test_state();
    let app_id = unique_app_id();
    state
        .apps
        .save(&App {
            id: app_id.clone(),
            name: "short-lived".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            rate_limit: RateLimitConfig::FixedWindow {
                window: 60,
                requests: 3,
            },
            user_id: None,
        })
        .await
        .unwrap();
    assert!(state.apps.delete(&app_id).await.unwrap());

    let router = server::build_router(state);
    let mut request = Request::builder()
        .uri(format!("/apis/{}/users", app_id))
        .header("x-api-key", "test-key")
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
#[ignore]
async fn test_worker_records_failure_for_missing_app() {
    let kv = test_kv();
    let node_id = format!("node:test-{}", Uuid::new_v4());
    let stream = RequestStream::new(kv.clone(), &node_id);
    stream.create_group().await.unwrap();

    let ticket = Uuid::new_v4().to_string();
    stream
        .append(&DeferredRequest {
            id: ticket.clone(),
            app_id: "never-registered".to_string(),
            method: "GET".to_string(),
            path: "ping".to_string(),
            headers: HashMap::new(),
            body: None,
            enqueued_at: 0,
        })
        .await
        .unwrap();

    let outcomes = OutcomeStore::new(kv.clone());
    let ctx = Arc::new(WorkerContext {
        kv: kv.clone(),
        apps: AppStore::new(kv.clone()),
        engine: test_engine(kv.clone()),
        outcomes: outcomes.clone(),
        upstream: UpstreamClient::new().unwrap(),
    });

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let worker_handle = tokio::spawn(worker::run(
        ctx,
        stream.clone(),
        format!("{}:worker:test", node_id),
        stop_rx,
    ));

    let mut outcome = None;
    for _ in 0..50 {
        if let Some(found) = outcomes.get(&ticket).await.unwrap() {
            outcome = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = stop_tx.send(true);
    worker_handle.await.unwrap();

    match outcome {
        Some(Outcome::Failed { error }) => assert!(error.contains("never-registered")),
        other => panic!("expected failed outcome, got {:?}", other),
    }
}
