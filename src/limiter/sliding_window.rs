//! Weighted sliding window.
//!
//! Approximates a true sliding window from two fixed buckets: the previous
//! bucket's count decays linearly as the current window fills. Cheaper than
//! the sorted-set log, accurate to within the linear-decay error.

use crate::error::GatewayResult;
use crate::kv::KvClient;
use crate::limiter::{now_millis, Decision, Limiter};
use async_trait::async_trait;
use redis::AsyncCommands;

pub struct SlidingWindowLimiter {
    kv: KvClient,
    window: u64,
    requests: u64,
}

/// Weighted count across the previous and current buckets, with `elapsed`
/// the fraction of the current window already consumed.
pub(crate) fn estimated_count(previous: u64, current: u64, elapsed: f64) -> f64 {
    previous as f64 * (1.0 - elapsed) + current as f64
}

impl SlidingWindowLimiter {
    pub fn new(kv: KvClient, window: u64, requests: u64) -> Self {
        Self {
            kv,
            window,
            requests,
        }
    }

    fn window_key(&self, app_id: &str, bucket: u64) -> String {
        format!("{{sliding:{}}}:{}", app_id, bucket)
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    async fn check(&self, app_id: &str) -> GatewayResult<Decision> {
        let window_ms = self.window * 1000;
        loop {
            let now = now_millis();
            let bucket = now / window_ms;
            let current_key = self.window_key(app_id, bucket);
            let previous_key = self.window_key(app_id, bucket.wrapping_sub(1));
            let elapsed = (now % window_ms) as f64 / window_ms as f64;

            let mut conn = self.kv.connection().await?;
            redis::cmd("WATCH")
                .arg(&current_key)
                .arg(&previous_key)
                .query_async::<_, ()>(&mut conn)
                .await?;

            let current: Option<u64> = conn.get(&current_key).await?;
            let previous: Option<u64> = conn.get(&previous_key).await?;

            let estimate =
                estimated_count(previous.unwrap_or(0), current.unwrap_or(0), elapsed);
            if estimate >= self.requests as f64 {
                redis::cmd("UNWATCH").query_async::<_, ()>(&mut conn).await?;
                return Ok(Decision::Deny);
            }

            let mut pipe = redis::pipe();
            pipe.atomic().incr(&current_key, 1i64).ignore();
            if current.is_none() {
                // Twice the window, so this bucket is still readable as the
                // "previous" bucket for a full window after it closes.
                pipe.expire(&current_key, (2 * self.window) as i64).ignore();
            }

            let committed: Option<()> = pipe.query_async(&mut conn).await?;
            if committed.is_some() {
                return Ok(Decision::Admit);
            }
        }
    }
}
