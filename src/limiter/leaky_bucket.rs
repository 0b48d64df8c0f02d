//! Leaky bucket.
//!
//! State is a hash of `{count, lastLeak}`. The bucket drains in whole units
//! at `leakRate` per second; an admit adds one unit. Leakage uses a floor,
//! so sub-second drain intervals round down (can under-leak at very low
//! rates). `lastLeak` only advances on admit.

use crate::error::{GatewayError, GatewayResult};
use crate::kv::KvClient;
use crate::limiter::{now_millis, Decision, Limiter};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;

pub struct LeakyBucketLimiter {
    kv: KvClient,
    requests: u64,
    leak_rate: f64,
}

/// Bucket level at `now` after draining whole units since `last_leak_ms`.
pub(crate) fn leak(count: u64, last_leak_ms: u64, now_ms: u64, rate: f64) -> u64 {
    let elapsed_secs = now_ms.saturating_sub(last_leak_ms) as f64 / 1000.0;
    let drained = (elapsed_secs * rate).floor() as u64;
    count.saturating_sub(drained)
}

pub(crate) fn state_ttl_secs(requests: u64, rate: f64) -> usize {
    2 * (requests as f64 / rate).ceil() as usize
}

fn parse_field(state: &HashMap<String, String>, field: &str) -> GatewayResult<u64> {
    state
        .get(field)
        .ok_or_else(|| GatewayError::Store(format!("leaky bucket missing field: {}", field)))?
        .parse::<u64>()
        .map_err(|_| GatewayError::Store(format!("invalid leaky bucket field: {}", field)))
}

impl LeakyBucketLimiter {
    pub fn new(kv: KvClient, requests: u64, leak_rate: f64) -> Self {
        Self {
            kv,
            requests,
            leak_rate,
        }
    }

    fn bucket_key(&self, app_id: &str) -> String {
        format!("{{leaky:{}}}", app_id)
    }
}

#[async_trait]
impl Limiter for LeakyBucketLimiter {
    async fn check(&self, app_id: &str) -> GatewayResult<Decision> {
        let key = self.bucket_key(app_id);

        loop {
            let mut conn = self.kv.connection().await?;
            redis::cmd("WATCH")
                .arg(&key)
                .query_async::<_, ()>(&mut conn)
                .await?;

            let state: HashMap<String, String> = conn.hgetall(&key).await?;
            let now = now_millis();

            let count = if state.is_empty() {
                0
            } else {
                let stored = parse_field(&state, "count")?;
                let last_leak = parse_field(&state, "lastLeak")?;
                leak(stored, last_leak, now, self.leak_rate)
            };

            if count >= self.requests {
                redis::cmd("UNWATCH").query_async::<_, ()>(&mut conn).await?;
                return Ok(Decision::Deny);
            }

            let mut pipe = redis::pipe();
            pipe.atomic()
                .hset(&key, "count", (count + 1).to_string())
                .ignore()
                .hset(&key, "lastLeak", now.to_string())
                .ignore()
                .expire(&key, state_ttl_secs(self.requests, self.leak_rate) as i64)
                .ignore();

            let committed: Option<()> = pipe.query_async(&mut conn).await?;
            if committed.is_some() {
                return Ok(Decision::Admit);
            }
        }
    }
}
