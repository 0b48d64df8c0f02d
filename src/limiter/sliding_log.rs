//! Sliding log.
//!
//! A sorted set of admit timestamps, pruned to the window on every call.
//! Exact (no approximation error) at the cost of memory proportional to the
//! observed rate. Score and member are both the millisecond timestamp, so
//! two admits in the same millisecond collapse into one member.

use crate::error::GatewayResult;
use crate::kv::KvClient;
use crate::limiter::{now_millis, Decision, Limiter};
use async_trait::async_trait;
use redis::AsyncCommands;

pub struct SlidingLogLimiter {
    kv: KvClient,
    window: u64,
    requests: u64,
}

impl SlidingLogLimiter {
    pub fn new(kv: KvClient, window: u64, requests: u64) -> Self {
        Self {
            kv,
            window,
            requests,
        }
    }

    fn log_key(&self, app_id: &str) -> String {
        format!("{{log:{}}}", app_id)
    }
}

#[async_trait]
impl Limiter for SlidingLogLimiter {
    async fn check(&self, app_id: &str) -> GatewayResult<Decision> {
        let key = self.log_key(app_id);

        loop {
            let now = now_millis();
            let horizon = now.saturating_sub(self.window * 1000);

            let mut conn = self.kv.connection().await?;

            // Prune before WATCH: removing members of a key we watch on the
            // same connection would invalidate our own transaction. The
            // prune is idempotent, so running it outside the commit is safe.
            let _: u64 = conn
                .zrembyscore(&key, "-inf", format!("({}", horizon))
                .await?;

            redis::cmd("WATCH")
                .arg(&key)
                .query_async::<_, ()>(&mut conn)
                .await?;

            let cardinality: u64 = conn.zcard(&key).await?;
            if cardinality >= self.requests {
                redis::cmd("UNWATCH").query_async::<_, ()>(&mut conn).await?;
                return Ok(Decision::Deny);
            }

            let mut pipe = redis::pipe();
            pipe.atomic()
                .zadd(&key, now, now)
                .ignore()
                .expire(&key, self.window as i64)
                .ignore();

            let committed: Option<()> = pipe.query_async(&mut conn).await?;
            if committed.is_some() {
                return Ok(Decision::Admit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_log_key_is_hash_tagged() {
        let kv = KvClient::new(&Config::default()).unwrap();
        let limiter = SlidingLogLimiter::new(kv, 2, 2);
        assert_eq!(limiter.log_key("app1"), "{log:app1}");
    }
}
