pub mod apps;
pub mod config;
pub mod error;
pub mod handlers;
pub mod kv;
pub mod limiter;
pub mod manager;
pub mod middleware;
pub mod queue;
pub mod response;
pub mod server;
pub mod upstream;
pub mod worker;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use kv::KvClient;
pub use limiter::{Decision, RateLimitConfig, RateLimitEngine};
