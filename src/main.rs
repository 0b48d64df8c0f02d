use anyhow::Result;
use limitgate::apps::AppStore;
use limitgate::config::Config;
use limitgate::handlers::AppState;
use limitgate::kv::KvClient;
use limitgate::limiter::RateLimitEngine;
use limitgate::manager::{NodeId, NodeIdAllocator, WorkerPool};
use limitgate::queue::{OutcomeStore, RequestStream};
use limitgate::server;
use limitgate::upstream::UpstreamClient;
use limitgate::worker::WorkerContext;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Load configuration from environment
    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("limitgate={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting limitgate gateway");
    tracing::info!(
        "Configuration: bind_address={}, redis_url={}",
        config.bind_address(),
        config.redis_url
    );

    let kv = KvClient::new(&config)
        .map_err(|e| anyhow::anyhow!("Failed to create KV client: {}", e))?;
    kv.ping()
        .await
        .map_err(|e| anyhow::anyhow!("KV store unreachable: {}", e))?;

    // Node identity: a fixed SERVER_ID bypasses the shared allocator.
    let allocator = NodeIdAllocator::new(kv.clone());
    let (node_id, owns_node_id) = match config.server_id.clone() {
        Some(id) => (NodeId::from(id), false),
        None => (allocator.acquire().await?, true),
    };
    tracing::info!(node_id = %node_id, "node identity acquired");

    let stream = RequestStream::new(kv.clone(), node_id.as_str());
    stream.create_group().await?;

    let apps = AppStore::new(kv.clone());
    let engine = RateLimitEngine::new(kv.clone(), config.max_retries, config.retry_delay);
    let outcomes = OutcomeStore::new(kv.clone());
    let upstream = UpstreamClient::new()?;

    let worker_ctx = Arc::new(WorkerContext {
        kv: kv.clone(),
        apps: apps.clone(),
        engine: engine.clone(),
        outcomes: outcomes.clone(),
        upstream: upstream.clone(),
    });

    let pool = WorkerPool::new(
        node_id,
        owns_node_id,
        allocator,
        worker_ctx,
        stream.clone(),
        config.max_workers,
        config.max_queued_requests,
        config.max_stream_length,
    );
    let (pool_shutdown_tx, pool_shutdown_rx) = watch::channel(false);
    let pool_handle = tokio::spawn(pool.run(pool_shutdown_rx));

    let state = AppState {
        apps,
        engine,
        stream,
        outcomes,
        upstream,
        kv,
    };

    server::run(&config, state)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    // HTTP surface is down; wind the worker pool down and return the node id.
    let _ = pool_shutdown_tx.send(true);
    pool_handle.await?;

    tracing::info!("shutdown complete");
    Ok(())
}
