//! Worker pool manager.
//!
//! Owns the node's identity and worker lifecycle. Node ids come from a
//! shared allocator (a free pool plus a counter capped at 100 ids across the
//! cluster's lifetime) so per-node stream keys stay bounded. A timer-driven
//! loop scales the worker count against the observed backlog and keeps the
//! stream under its length cap without dropping in-flight entries.

use crate::error::{GatewayError, GatewayResult};
use crate::kv::KvClient;
use crate::limiter::now_millis;
use crate::queue::RequestStream;
use crate::worker::{self, WorkerContext};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const POOL_KEY: &str = "server:pool";
const COUNTER_KEY: &str = "server:counter";

/// Hard ceiling on node ids ever minted by the counter.
pub const MAX_NODE_IDS: i64 = 100;

const SCALE_INTERVAL: Duration = Duration::from_secs(5);
const RETIRE_GRACE: Duration = Duration::from_secs(1);

/// Node identity within the cluster.
///
/// Names the per-node stream and consumer group keys and prefixes every
/// consumer id this node registers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Shared node-id allocator: `acquire` prefers recycled ids from the free
/// pool, minting a fresh one only while the counter stays under the ceiling.
#[derive(Clone)]
pub struct NodeIdAllocator {
    kv: KvClient,
}

impl NodeIdAllocator {
    pub fn new(kv: KvClient) -> Self {
        Self { kv }
    }

    pub async fn acquire(&self) -> GatewayResult<NodeId> {
        if let Some(id) = self.kv.set_pop(POOL_KEY).await? {
            debug!(node_id = %id, "reusing node id from the free pool");
            return Ok(NodeId::from(id));
        }

        let minted = self.kv.counter_incr(COUNTER_KEY).await?;
        if minted > MAX_NODE_IDS {
            return Err(GatewayError::Config(
                "Maximum number of node IDs reached".to_string(),
            ));
        }
        Ok(NodeId::from(format!("node:{}", minted)))
    }

    pub async fn release(&self, node_id: &NodeId) -> GatewayResult<()> {
        self.kv.set_add(POOL_KEY, node_id.as_str()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScaleAction {
    Spawn,
    Retire,
    Hold,
}

/// Scaling rule evaluated every tick. An empty stream still ramps workers up
/// so a node that just drained keeps capacity warm.
pub(crate) fn scale_action(
    stream_len: u64,
    workers: usize,
    lo: u64,
    hi: usize,
) -> ScaleAction {
    if (stream_len > lo || stream_len == 0) && workers < hi {
        ScaleAction::Spawn
    } else if stream_len < lo / 2 && workers > 1 {
        ScaleAction::Retire
    } else {
        ScaleAction::Hold
    }
}

struct WorkerHandle {
    consumer_id: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct WorkerPool {
    node_id: NodeId,
    owns_node_id: bool,
    allocator: NodeIdAllocator,
    ctx: Arc<WorkerContext>,
    stream: RequestStream,
    max_workers: usize,
    max_queued_requests: u64,
    max_stream_length: u64,
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn new(
        node_id: NodeId,
        owns_node_id: bool,
        allocator: NodeIdAllocator,
        ctx: Arc<WorkerContext>,
        stream: RequestStream,
        max_workers: usize,
        max_queued_requests: u64,
        max_stream_length: u64,
    ) -> Self {
        Self {
            node_id,
            owns_node_id,
            allocator,
            ctx,
            stream,
            max_workers,
            max_queued_requests,
            max_stream_length,
            workers: Vec::new(),
        }
    }

    /// Scaling loop; runs until the shutdown signal fires, then winds the
    /// pool down and returns the node id to the free pool.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(SCALE_INTERVAL);
        info!(node_id = %self.node_id, "worker pool manager started");

        loop {
            tokio::select! {
                _ = tick.tick() => self.balance().await,
                _ = shutdown.changed() => break,
            }
        }

        self.shutdown().await;
    }

    async fn balance(&mut self) {
        let stream_len = match self.stream.len().await {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "failed to read stream length");
                return;
            }
        };

        self.enforce_stream_cap(stream_len).await;

        match scale_action(
            stream_len,
            self.workers.len(),
            self.max_queued_requests,
            self.max_workers,
        ) {
            ScaleAction::Spawn => self.spawn_worker(),
            ScaleAction::Retire => self.retire_worker().await,
            ScaleAction::Hold => {}
        }
    }

    /// Trim surplus when the stream outgrows its cap. Never trims past the
    /// oldest still-pending entry: only acknowledged history is dropped.
    async fn enforce_stream_cap(&self, stream_len: u64) {
        if stream_len <= self.max_stream_length {
            return;
        }

        let result = match self.stream.oldest_pending_id().await {
            Ok(Some(min_id)) => self.stream.trim_to_min_id(&min_id).await,
            Ok(None) => {
                self.stream
                    .trim_to_max_len(self.max_stream_length as usize)
                    .await
            }
            Err(e) => {
                warn!(error = %e, "failed to read pending summary, skipping trim");
                return;
            }
        };

        match result {
            Ok(trimmed) => {
                if trimmed > 0 {
                    info!(stream_len, trimmed, "trimmed stream backlog");
                }
            }
            Err(e) => warn!(error = %e, "stream trim failed"),
        }
    }

    fn spawn_worker(&mut self) {
        let consumer_id = format!("{}:worker:{}", self.node_id, now_millis());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker::run(
            self.ctx.clone(),
            self.stream.clone(),
            consumer_id.clone(),
            stop_rx,
        ));

        info!(consumer = %consumer_id, workers = self.workers.len() + 1, "spawned worker");
        self.workers.push(WorkerHandle {
            consumer_id,
            stop: stop_tx,
            handle,
        });
    }

    /// Stop the newest worker, give an in-flight batch a moment to finish,
    /// then remove the consumer so the group stops tracking it.
    async fn retire_worker(&mut self) {
        let Some(worker) = self.workers.pop() else {
            return;
        };

        info!(consumer = %worker.consumer_id, workers = self.workers.len(), "retiring worker");
        let _ = worker.stop.send(true);
        tokio::time::sleep(RETIRE_GRACE).await;

        if let Err(e) = self.stream.delete_consumer(&worker.consumer_id).await {
            warn!(consumer = %worker.consumer_id, error = %e, "failed to delete consumer");
        }
        if let Err(e) = worker.handle.await {
            warn!(consumer = %worker.consumer_id, error = %e, "worker task join failed");
        }
    }

    async fn shutdown(mut self) {
        info!(node_id = %self.node_id, "worker pool shutting down");

        for worker in &self.workers {
            let _ = worker.stop.send(true);
        }
        tokio::time::sleep(RETIRE_GRACE).await;

        for worker in self.workers.drain(..) {
            if let Err(e) = self.stream.delete_consumer(&worker.consumer_id).await {
                warn!(consumer = %worker.consumer_id, error = %e, "failed to delete consumer");
            }
            if let Err(e) = worker.handle.await {
                warn!(consumer = %worker.consumer_id, error = %e, "worker task join failed");
            }
        }

        if self.owns_node_id {
            match self.allocator.release(&self.node_id).await {
                Ok(()) => info!(node_id = %self.node_id, "node id returned to the pool"),
                Err(e) => error!(node_id = %self.node_id, error = %e, "failed to release node id"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_round_trip() {
        let id = NodeId::from("node:3");
        assert_eq!(id.to_string(), "node:3");
        assert_eq!(id.as_str(), "node:3");
    }

    #[test]
    fn test_node_id_equality() {
        assert_eq!(NodeId::from("node:1"), NodeId::from("node:1".to_string()));
        assert_ne!(NodeId::from("node:1"), NodeId::from("node:2"));
    }

    #[test]
    fn test_node_id_names_consumer_prefix() {
        let id = NodeId::from("node:4");
        assert_eq!(format!("{}:worker:123", id), "node:4:worker:123");
    }

    #[test]
    fn test_spawn_on_backlog() {
        assert_eq!(scale_action(150, 2, 100, 10), ScaleAction::Spawn);
    }

    #[test]
    fn test_spawn_on_idle_stream() {
        assert_eq!(scale_action(0, 3, 100, 10), ScaleAction::Spawn);
    }

    #[test]
    fn test_spawn_respects_ceiling() {
        assert_eq!(scale_action(150, 10, 100, 10), ScaleAction::Hold);
        assert_eq!(scale_action(0, 10, 100, 10), ScaleAction::Hold);
    }

    #[test]
    fn test_retire_on_shallow_backlog() {
        assert_eq!(scale_action(20, 4, 100, 10), ScaleAction::Retire);
    }

    #[test]
    fn test_retire_keeps_one_worker() {
        assert_eq!(scale_action(20, 1, 100, 10), ScaleAction::Hold);
    }

    #[test]
    fn test_hold_in_comfortable_band() {
        assert_eq!(scale_action(80, 4, 100, 10), ScaleAction::Hold);
    }
}
