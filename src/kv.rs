//! Typed access to the shared KV store.
//!
//! Every multi-node coordination primitive the gateway relies on lives here:
//! counters with TTL-on-first-write, hashes, sorted sets, streams with
//! consumer groups, and the free-id set used by the node allocator. All
//! helpers open a fresh connection per operation and retry cluster-redirect
//! errors a bounded number of times. The rate-limit strategies borrow raw
//! connections instead, because WATCH is connection-scoped.

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use redis::aio::Connection;
use redis::streams::{
    StreamMaxlen, StreamPendingReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, ErrorKind, RedisError, RedisResult};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// True for error kinds raised when cluster slots move between shards.
pub fn is_redirect(error: &RedisError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::Moved | ErrorKind::Ask | ErrorKind::TryAgain | ErrorKind::ClusterDown
    )
}

#[derive(Clone)]
pub struct KvClient {
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl KvClient {
    pub fn new(config: &Config) -> GatewayResult<Self> {
        let client = Client::open(config.redis_url.as_str()).map_err(|e| {
            GatewayError::Config(format!("Failed to create KV client: {}", e))
        })?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        })
    }

    /// A dedicated connection for WATCH-based decision transactions.
    pub async fn connection(&self) -> GatewayResult<Connection> {
        self.raw_connection().await.map_err(GatewayError::from)
    }

    async fn raw_connection(&self) -> RedisResult<Connection> {
        match timeout(CONNECT_TIMEOUT, self.client.get_async_connection()).await {
            Ok(result) => result,
            Err(_) => Err(RedisError::from((
                ErrorKind::IoError,
                "connection timeout",
            ))),
        }
    }

    /// Run `op`, retrying cluster redirects up to the configured bound with a
    /// fixed pause between attempts.
    async fn retry<T, F, Fut>(&self, name: &str, mut op: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_redirect(&err) && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(op = name, attempt, error = %err, "KV redirect, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => {
                    if is_redirect(&err) {
                        warn!(op = name, error = %err, "KV redirect retries exhausted");
                    }
                    return Err(err.into());
                }
            }
        }
    }

    pub async fn ping(&self) -> GatewayResult<()> {
        let response: String = self
            .retry("ping", || async move {
                let mut conn = self.raw_connection().await?;
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;

        if response == "PONG" {
            debug!("KV ping successful");
            Ok(())
        } else {
            Err(GatewayError::Store("Unexpected ping response".to_string()))
        }
    }

    pub async fn get_string(&self, key: &str) -> GatewayResult<Option<String>> {
        self.retry("get", || async move {
            let mut conn = self.raw_connection().await?;
            conn.get(key).await
        })
        .await
    }

    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_secs: usize,
    ) -> GatewayResult<()> {
        self.retry("set_ex", || async move {
            let mut conn = self.raw_connection().await?;
            conn.set_ex(key, value, ttl_secs as u64).await
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> GatewayResult<bool> {
        let deleted: u64 = self
            .retry("del", || async move {
                let mut conn = self.raw_connection().await?;
                conn.del(key).await
            })
            .await?;
        Ok(deleted > 0)
    }

    pub async fn hash_get_all(&self, key: &str) -> GatewayResult<HashMap<String, String>> {
        self.retry("hgetall", || async move {
            let mut conn = self.raw_connection().await?;
            conn.hgetall(key).await
        })
        .await
    }

    pub async fn hash_set_fields(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> GatewayResult<()> {
        self.retry("hset", || async move {
            let mut conn = self.raw_connection().await?;
            conn.hset_multiple(key, fields).await
        })
        .await
    }

    pub async fn counter_incr(&self, key: &str) -> GatewayResult<i64> {
        self.retry("incr", || async move {
            let mut conn = self.raw_connection().await?;
            conn.incr(key, 1i64).await
        })
        .await
    }

    pub async fn set_add(&self, key: &str, member: &str) -> GatewayResult<()> {
        self.retry("sadd", || async move {
            let mut conn = self.raw_connection().await?;
            conn.sadd(key, member).await
        })
        .await
    }

    pub async fn set_pop(&self, key: &str) -> GatewayResult<Option<String>> {
        self.retry("spop", || async move {
            let mut conn = self.raw_connection().await?;
            conn.spop(key).await
        })
        .await
    }

    pub async fn set_contains(&self, key: &str, member: &str) -> GatewayResult<bool> {
        self.retry("sismember", || async move {
            let mut conn = self.raw_connection().await?;
            conn.sismember(key, member).await
        })
        .await
    }

    /// Append one entry to a stream; returns the generated entry id.
    pub async fn stream_append(
        &self,
        stream: &str,
        field: &str,
        payload: &str,
    ) -> GatewayResult<String> {
        self.retry("xadd", || async move {
            let mut conn = self.raw_connection().await?;
            conn.xadd(stream, "*", &[(field, payload)]).await
        })
        .await
    }

    /// Create the consumer group at cursor 0, creating the stream if needed.
    /// A group that already exists is not an error.
    pub async fn stream_create_group(&self, stream: &str, group: &str) -> GatewayResult<()> {
        self.retry("xgroup_create", || async move {
            let mut conn = self.raw_connection().await?;
            let result: RedisResult<()> =
                conn.xgroup_create_mkstream(stream, group, "0").await;
            match result {
                Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
                other => other,
            }
        })
        .await
    }

    /// Read up to `count` undelivered entries for `consumer`, blocking up to
    /// `block_ms`. Returns `(entry_id, fields)` pairs.
    pub async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> GatewayResult<Vec<(String, HashMap<String, redis::Value>)>> {
        let reply: Option<StreamReadReply> = self
            .retry("xreadgroup", || async move {
                let mut conn = self.raw_connection().await?;
                let options = StreamReadOptions::default()
                    .group(group, consumer)
                    .count(count)
                    .block(block_ms);
                conn.xread_options(&[stream], &[">"], &options).await
            })
            .await?;

        let mut entries = Vec::new();
        if let Some(reply) = reply {
            for key in reply.keys {
                for id in key.ids {
                    entries.push((id.id, id.map));
                }
            }
        }
        Ok(entries)
    }

    pub async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> GatewayResult<()> {
        let _: i64 = self
            .retry("xack", || async move {
                let mut conn = self.raw_connection().await?;
                conn.xack(stream, group, &[id]).await
            })
            .await?;
        Ok(())
    }

    pub async fn stream_len(&self, stream: &str) -> GatewayResult<u64> {
        self.retry("xlen", || async move {
            let mut conn = self.raw_connection().await?;
            conn.xlen(stream).await
        })
        .await
    }

    /// Entry id of the oldest delivered-but-unacknowledged entry, if any.
    pub async fn stream_oldest_pending(
        &self,
        stream: &str,
        group: &str,
    ) -> GatewayResult<Option<String>> {
        let reply: StreamPendingReply = self
            .retry("xpending", || async move {
                let mut conn = self.raw_connection().await?;
                conn.xpending(stream, group).await
            })
            .await?;

        match reply {
            StreamPendingReply::Empty => Ok(None),
            StreamPendingReply::Data(data) => Ok(Some(data.start_id)),
        }
    }

    /// Drop all entries with an id strictly below `min_id`.
    pub async fn stream_trim_min_id(&self, stream: &str, min_id: &str) -> GatewayResult<u64> {
        self.retry("xtrim_minid", || async move {
            let mut conn = self.raw_connection().await?;
            redis::cmd("XTRIM")
                .arg(stream)
                .arg("MINID")
                .arg(min_id)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    pub async fn stream_trim_max_len(&self, stream: &str, max_len: usize) -> GatewayResult<u64> {
        self.retry("xtrim_maxlen", || async move {
            let mut conn = self.raw_connection().await?;
            conn.xtrim(stream, StreamMaxlen::Approx(max_len)).await
        })
        .await
    }

    pub async fn stream_delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> GatewayResult<u64> {
        self.retry("xgroup_delconsumer", || async move {
            let mut conn = self.raw_connection().await?;
            redis::cmd("XGROUP")
                .arg("DELCONSUMER")
                .arg(stream)
                .arg(group)
                .arg(consumer)
                .query_async(&mut conn)
                .await
        })
        .await
    }
}
