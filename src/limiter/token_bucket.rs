//! Token bucket.
//!
//! State is a hash of `{tokens, lastRefill}`. Tokens accrue continuously at
//! `refillRate` per second up to `burst`; each admit costs one token. A
//! bucket first observed full grants the whole burst immediately.

use crate::error::{GatewayError, GatewayResult};
use crate::kv::KvClient;
use crate::limiter::{now_millis, Decision, Limiter};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;

pub struct TokenBucketLimiter {
    kv: KvClient,
    burst: u64,
    refill_rate: f64,
}

/// Tokens available at `now`, given the stored level and refill timestamp.
pub(crate) fn refill(tokens: f64, last_refill_ms: u64, now_ms: u64, rate: f64, burst: f64) -> f64 {
    let elapsed_secs = now_ms.saturating_sub(last_refill_ms) as f64 / 1000.0;
    (tokens + elapsed_secs * rate).min(burst)
}

/// State survives twice the time a drained bucket needs to refill.
pub(crate) fn state_ttl_secs(burst: u64, rate: f64) -> usize {
    2 * (burst as f64 / rate).ceil() as usize
}

fn parse_field(state: &HashMap<String, String>, field: &str) -> GatewayResult<f64> {
    state
        .get(field)
        .ok_or_else(|| GatewayError::Store(format!("token bucket missing field: {}", field)))?
        .parse::<f64>()
        .map_err(|_| GatewayError::Store(format!("invalid token bucket field: {}", field)))
}

impl TokenBucketLimiter {
    pub fn new(kv: KvClient, burst: u64, refill_rate: f64) -> Self {
        Self {
            kv,
            burst,
            refill_rate,
        }
    }

    fn bucket_key(&self, app_id: &str) -> String {
        format!("{{bucket:{}}}", app_id)
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    async fn check(&self, app_id: &str) -> GatewayResult<Decision> {
        let key = self.bucket_key(app_id);
        let capacity = self.burst as f64;

        loop {
            let mut conn = self.kv.connection().await?;
            redis::cmd("WATCH")
                .arg(&key)
                .query_async::<_, ()>(&mut conn)
                .await?;

            let state: HashMap<String, String> = conn.hgetall(&key).await?;
            let now = now_millis();

            let tokens = if state.is_empty() {
                capacity
            } else {
                let stored = parse_field(&state, "tokens")?;
                let last_refill = parse_field(&state, "lastRefill")? as u64;
                refill(stored, last_refill, now, self.refill_rate, capacity)
            };

            if tokens < 1.0 {
                redis::cmd("UNWATCH").query_async::<_, ()>(&mut conn).await?;
                return Ok(Decision::Deny);
            }

            let mut pipe = redis::pipe();
            pipe.atomic()
                .hset(&key, "tokens", (tokens - 1.0).to_string())
                .ignore()
                .hset(&key, "lastRefill", now.to_string())
                .ignore()
                .expire(&key, state_ttl_secs(self.burst, self.refill_rate) as i64)
                .ignore();

            let committed: Option<()> = pipe.query_async(&mut conn).await?;
            if committed.is_some() {
                return Ok(Decision::Admit);
            }
        }
    }
}
