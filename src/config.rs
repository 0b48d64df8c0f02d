use std::env;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub redis_url: String,
    pub log_level: String,
    /// Session-token key, held for the external auth subsystem.
    pub jwt_secret: Option<String>,
    /// Fixed node id; bypasses the shared allocator when set.
    pub server_id: Option<String>,
    pub max_workers: usize,
    pub max_queued_requests: u64,
    pub max_stream_length: u64,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort(String),
    InvalidWorkerCount(String),
    InvalidQueueBound(String),
    InvalidStreamCap(String),
    InvalidRetries(String),
    InvalidRetryDelay(String),
    InvalidRedisDb(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort(msg) => write!(f, "Invalid port: {}", msg),
            ConfigError::InvalidWorkerCount(msg) => write!(f, "Invalid worker count: {}", msg),
            ConfigError::InvalidQueueBound(msg) => write!(f, "Invalid queue bound: {}", msg),
            ConfigError::InvalidStreamCap(msg) => write!(f, "Invalid stream cap: {}", msg),
            ConfigError::InvalidRetries(msg) => write!(f, "Invalid retry count: {}", msg),
            ConfigError::InvalidRetryDelay(msg) => write!(f, "Invalid retry delay: {}", msg),
            ConfigError::InvalidRedisDb(msg) => write!(f, "Invalid redis db: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 8080,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            log_level: "info".to_string(),
            jwt_secret: None,
            server_id: None,
            max_workers: 10,
            max_queued_requests: 100,
            max_stream_length: 10_000,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = env::var("HOST") {
            config.server_host = host;
        }

        if let Ok(port_str) = env::var("PORT") {
            config.server_port = port_str
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port_str))?;
        }

        config.redis_url = match env::var("REDIS_URL") {
            Ok(url) => url,
            Err(_) => Self::redis_url_from_parts()?,
        };

        if let Ok(level) = env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config.jwt_secret = env::var("JWT_SECRET").ok();
        config.server_id = env::var("SERVER_ID").ok();

        if let Ok(workers_str) = env::var("MAX_WORKERS") {
            config.max_workers = workers_str
                .parse()
                .map_err(|_| ConfigError::InvalidWorkerCount(workers_str))?;
        }

        if let Ok(queued_str) = env::var("MAX_QUEUED_REQUESTS") {
            config.max_queued_requests = queued_str
                .parse()
                .map_err(|_| ConfigError::InvalidQueueBound(queued_str))?;
        }

        if let Ok(cap_str) = env::var("MAX_STREAM_LENGTH") {
            config.max_stream_length = cap_str
                .parse()
                .map_err(|_| ConfigError::InvalidStreamCap(cap_str))?;
        }

        if let Ok(retries_str) = env::var("MAX_RETRIES") {
            config.max_retries = retries_str
                .parse()
                .map_err(|_| ConfigError::InvalidRetries(retries_str))?;
        }

        if let Ok(delay_str) = env::var("RETRY_DELAY_SECS") {
            let secs: u64 = delay_str
                .parse()
                .map_err(|_| ConfigError::InvalidRetryDelay(delay_str))?;
            config.retry_delay = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Compose a redis URL from the discrete REDIS_* variables when
    /// REDIS_URL is not set.
    fn redis_url_from_parts() -> Result<String, ConfigError> {
        let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
        let db = match env::var("REDIS_DB") {
            Ok(db_str) => {
                let db: u32 = db_str
                    .parse()
                    .map_err(|_| ConfigError::InvalidRedisDb(db_str))?;
                db
            }
            Err(_) => 0,
        };

        let url = match env::var("REDIS_PASSWORD") {
            Ok(password) if !password.is_empty() => {
                format!("redis://:{}@{}:{}/{}", password, host, port, db)
            }
            _ => format!("redis://{}:{}/{}", host, port, db),
        };
        Ok(url)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server_port == 0 {
            return Err(ConfigError::InvalidPort("Port cannot be 0".to_string()));
        }

        if self.max_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        if self.max_queued_requests == 0 {
            return Err(ConfigError::InvalidQueueBound(
                "Queue bound must be greater than 0".to_string(),
            ));
        }

        if self.max_stream_length == 0 {
            return Err(ConfigError::InvalidStreamCap(
                "Stream cap must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.max_queued_requests, 100);
        assert_eq!(config.max_stream_length, 10_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = Config {
            max_workers: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = Config {
            server_port: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_address() {
        let config = Config::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
    }
}
