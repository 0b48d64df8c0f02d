//! Registered applications and their KV-backed store.
//!
//! The management API that creates and edits applications lives outside this
//! service; the `app:<id>` hash is the contract both sides share.

use crate::error::{GatewayError, GatewayResult};
use crate::kv::KvClient;
use crate::limiter::RateLimitConfig;
use std::collections::HashMap;

fn app_key(app_id: &str) -> String {
    format!("app:{}", app_id)
}

/// A registered upstream API.
#[derive(Debug, Clone, PartialEq)]
pub struct App {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub rate_limit: RateLimitConfig,
    pub user_id: Option<String>,
}

impl App {
    fn from_hash(app_id: &str, fields: HashMap<String, String>) -> GatewayResult<Self> {
        let name = fields
            .get("name")
            .cloned()
            .ok_or_else(|| GatewayError::Store(format!("app {} missing field: name", app_id)))?;
        let base_url = fields.get("baseUrl").cloned().ok_or_else(|| {
            GatewayError::Store(format!("app {} missing field: baseUrl", app_id))
        })?;
        let raw_config = fields.get("rateLimit").ok_or_else(|| {
            GatewayError::Store(format!("app {} missing field: rateLimit", app_id))
        })?;

        let rate_limit: RateLimitConfig = serde_json::from_str(raw_config).map_err(|e| {
            GatewayError::Validation(format!("invalid rate limit config for {}: {}", app_id, e))
        })?;
        rate_limit.validate()?;

        Ok(Self {
            id: app_id.to_string(),
            name,
            base_url,
            rate_limit,
            user_id: fields.get("userId").cloned(),
        })
    }
}

#[derive(Clone)]
pub struct AppStore {
    kv: KvClient,
}

impl AppStore {
    pub fn new(kv: KvClient) -> Self {
        Self { kv }
    }

    /// Look up an application by id. `Ok(None)` when unregistered.
    pub async fn get(&self, app_id: &str) -> GatewayResult<Option<App>> {
        let fields = self.kv.hash_get_all(&app_key(app_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        App::from_hash(app_id, fields).map(Some)
    }

    /// Write an application record; the config is validated before anything
    /// touches the store.
    pub async fn save(&self, app: &App) -> GatewayResult<()> {
        app.rate_limit.validate()?;
        let config_json = serde_json::to_string(&app.rate_limit)?;

        let mut fields = vec![
            ("name", app.name.clone()),
            ("baseUrl", app.base_url.clone()),
            ("rateLimit", config_json),
        ];
        if let Some(user_id) = &app.user_id {
            fields.push(("userId", user_id.clone()));
        }

        self.kv.hash_set_fields(&app_key(&app.id), &fields).await
    }

    pub async fn delete(&self, app_id: &str) -> GatewayResult<bool> {
        self.kv.delete(&app_key(app_id)).await
    }
}
