//! Fixed window counter.
//!
//! One counter per `floor(now / window)` bucket. The window flips abruptly
//! at its boundary, so bursts of up to twice the cap can straddle two
//! adjacent buckets; that is the strategy's known trade-off.

use crate::error::GatewayResult;
use crate::kv::KvClient;
use crate::limiter::{now_secs, Decision, Limiter};
use async_trait::async_trait;
use redis::AsyncCommands;

pub struct FixedWindowLimiter {
    kv: KvClient,
    window: u64,
    requests: u64,
}

impl FixedWindowLimiter {
    pub fn new(kv: KvClient, window: u64, requests: u64) -> Self {
        Self {
            kv,
            window,
            requests,
        }
    }

    fn window_key(&self, app_id: &str, bucket: u64) -> String {
        format!("{{fixed:{}}}:{}", app_id, bucket)
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    async fn check(&self, app_id: &str) -> GatewayResult<Decision> {
        loop {
            let bucket = now_secs() / self.window;
            let key = self.window_key(app_id, bucket);

            let mut conn = self.kv.connection().await?;
            redis::cmd("WATCH")
                .arg(&key)
                .query_async::<_, ()>(&mut conn)
                .await?;

            let current: Option<u64> = conn.get(&key).await?;
            if current.unwrap_or(0) >= self.requests {
                redis::cmd("UNWATCH").query_async::<_, ()>(&mut conn).await?;
                return Ok(Decision::Deny);
            }

            let mut pipe = redis::pipe();
            pipe.atomic().incr(&key, 1i64).ignore();
            if current.is_none() {
                // TTL on first write only; later increments keep the
                // original window deadline.
                pipe.expire(&key, self.window as i64).ignore();
            }

            let committed: Option<()> = pipe.query_async(&mut conn).await?;
            if committed.is_some() {
                return Ok(Decision::Admit);
            }
            // A concurrent admit touched the counter; re-read and retry.
        }
    }
}
