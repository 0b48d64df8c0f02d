//! Rate-limit decision engine.
//!
//! Five strategies share one outer protocol: read the limiter state under a
//! WATCH, compute the decision, and commit the state update in an atomic
//! MULTI batch only when admitting. A nil EXEC reply means a concurrent
//! writer touched a watched key, so the strategy takes another look. Denials
//! release the watch and write nothing. State for one (strategy, app) pair
//! lives under a hash-tagged key family so a clustered store keeps the
//! multi-key transactions on a single shard.

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_log;
pub mod sliding_window;
pub mod token_bucket;

use crate::error::{GatewayError, GatewayResult};
use crate::kv::KvClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

pub use fixed_window::FixedWindowLimiter;
pub use leaky_bucket::LeakyBucketLimiter;
pub use sliding_log::SlidingLogLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

/// Outcome of a rate-limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Deny,
}

/// One rate-limiting strategy over the shared store.
///
/// Implementations own their key family and mutate state only on admit,
/// inside the optimistic commit.
#[async_trait]
pub trait Limiter: Send + Sync {
    async fn check(&self, app_id: &str) -> GatewayResult<Decision>;
}

/// Per-application limiter configuration, stored as the `rateLimit` JSON
/// field of the application hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RateLimitConfig {
    FixedWindow {
        window: u64,
        requests: u64,
    },
    SlidingWindow {
        window: u64,
        requests: u64,
    },
    TokenBucket {
        window: u64,
        requests: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        burst: Option<u64>,
        #[serde(rename = "refillRate", default, skip_serializing_if = "Option::is_none")]
        refill_rate: Option<f64>,
    },
    LeakyBucket {
        window: u64,
        requests: u64,
        #[serde(rename = "leakRate", default, skip_serializing_if = "Option::is_none")]
        leak_rate: Option<f64>,
    },
    SlidingLog {
        window: u64,
        requests: u64,
    },
}

impl RateLimitConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        let (window, requests) = match self {
            RateLimitConfig::FixedWindow { window, requests }
            | RateLimitConfig::SlidingWindow { window, requests }
            | RateLimitConfig::SlidingLog { window, requests } => (*window, *requests),
            RateLimitConfig::TokenBucket {
                window,
                requests,
                burst,
                refill_rate,
            } => {
                if let Some(burst) = burst {
                    if *burst == 0 {
                        return Err(GatewayError::Validation(
                            "burst must be greater than 0".to_string(),
                        ));
                    }
                }
                if let Some(rate) = refill_rate {
                    if !(*rate > 0.0) {
                        return Err(GatewayError::Validation(
                            "refillRate must be greater than 0".to_string(),
                        ));
                    }
                }
                (*window, *requests)
            }
            RateLimitConfig::LeakyBucket {
                window,
                requests,
                leak_rate,
            } => {
                if let Some(rate) = leak_rate {
                    if !(*rate > 0.0) {
                        return Err(GatewayError::Validation(
                            "leakRate must be greater than 0".to_string(),
                        ));
                    }
                }
                (*window, *requests)
            }
        };

        if window == 0 {
            return Err(GatewayError::Validation(
                "window must be greater than 0".to_string(),
            ));
        }
        if requests == 0 {
            return Err(GatewayError::Validation(
                "requests must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn strategy_name(&self) -> &'static str {
        match self {
            RateLimitConfig::FixedWindow { .. } => "fixed_window",
            RateLimitConfig::SlidingWindow { .. } => "sliding_window",
            RateLimitConfig::TokenBucket { .. } => "token_bucket",
            RateLimitConfig::LeakyBucket { .. } => "leaky_bucket",
            RateLimitConfig::SlidingLog { .. } => "sliding_log",
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Routes decisions to the strategy named by the application config.
#[derive(Clone)]
pub struct RateLimitEngine {
    kv: KvClient,
    max_retries: u32,
    retry_delay: Duration,
}

impl RateLimitEngine {
    pub fn new(kv: KvClient, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            kv,
            max_retries,
            retry_delay,
        }
    }

    /// Decide admit/deny for one request against `config`.
    ///
    /// Optimistic-commit conflicts retry inside the strategy without bound;
    /// cluster redirects retry the whole attempt up to the configured count.
    pub async fn decide(
        &self,
        app_id: &str,
        config: &RateLimitConfig,
    ) -> GatewayResult<Decision> {
        config.validate()?;

        let limiter: Box<dyn Limiter> = match config {
            RateLimitConfig::FixedWindow { window, requests } => {
                Box::new(FixedWindowLimiter::new(self.kv.clone(), *window, *requests))
            }
            RateLimitConfig::SlidingWindow { window, requests } => {
                Box::new(SlidingWindowLimiter::new(self.kv.clone(), *window, *requests))
            }
            RateLimitConfig::TokenBucket {
                requests,
                burst,
                refill_rate,
                ..
            } => Box::new(TokenBucketLimiter::new(
                self.kv.clone(),
                burst.unwrap_or(*requests),
                refill_rate.unwrap_or(1.0),
            )),
            RateLimitConfig::LeakyBucket {
                requests,
                leak_rate,
                ..
            } => Box::new(LeakyBucketLimiter::new(
                self.kv.clone(),
                *requests,
                leak_rate.unwrap_or(1.0),
            )),
            RateLimitConfig::SlidingLog { window, requests } => {
                Box::new(SlidingLogLimiter::new(self.kv.clone(), *window, *requests))
            }
        };

        let mut attempt = 0u32;
        loop {
            match limiter.check(app_id).await {
                Err(GatewayError::StoreRedirect(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        app_id,
                        strategy = config.strategy_name(),
                        attempt,
                        error = %msg,
                        "decision hit a cluster redirect, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                other => return other,
            }
        }
    }
}
