//! Deferred-request stream and outcome records.
//!
//! Each node owns one append-only stream and one consumer group. Entries
//! carry a single `payload` field with the serialised request record; a
//! worker that records an outcome acknowledges the entry, so everything in
//! the stream is either acknowledged history or pending under a named
//! consumer.

use crate::error::{GatewayError, GatewayResult};
use crate::kv::KvClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcomes survive two days, matching the status-poll contract.
pub const OUTCOME_TTL_SECS: usize = 48 * 60 * 60;

const PAYLOAD_FIELD: &str = "payload";

pub fn stream_key(node_id: &str) -> String {
    format!("stream:{}", node_id)
}

pub fn group_key(node_id: &str) -> String {
    format!("group:{}", node_id)
}

pub fn response_key(ticket_id: &str) -> String {
    format!("response:{}", ticket_id)
}

/// A request admitted past its limit and parked for deferred execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredRequest {
    /// Ticket id handed back to the client for status polling.
    pub id: String,
    #[serde(rename = "appId")]
    pub app_id: String,
    pub method: String,
    /// Path relative to the application's base URL, query string included.
    pub path: String,
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(rename = "enqueuedAt")]
    pub enqueued_at: u64,
}

/// Terminal state of a deferred request. `Pending` is only ever synthesised
/// by the status handler; the stored record is always terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Pending,
    Completed {
        #[serde(rename = "statusCode")]
        status_code: u16,
    },
    Failed {
        error: String,
    },
}

/// One entry as read from the stream: the id to acknowledge plus the raw
/// payload (parsed by the worker so a poison entry can still be drained).
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

#[derive(Clone)]
pub struct RequestStream {
    kv: KvClient,
    stream: String,
    group: String,
}

impl RequestStream {
    pub fn new(kv: KvClient, node_id: &str) -> Self {
        Self {
            kv,
            stream: stream_key(node_id),
            group: group_key(node_id),
        }
    }

    pub async fn create_group(&self) -> GatewayResult<()> {
        self.kv.stream_create_group(&self.stream, &self.group).await
    }

    /// Serialise and append a record; returns the stream entry id.
    pub async fn append(&self, request: &DeferredRequest) -> GatewayResult<String> {
        let payload = serde_json::to_string(request)?;
        self.kv
            .stream_append(&self.stream, PAYLOAD_FIELD, &payload)
            .await
    }

    pub async fn read_batch(
        &self,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> GatewayResult<Vec<StreamEntry>> {
        let raw = self
            .kv
            .stream_read_group(&self.stream, &self.group, consumer, count, block_ms)
            .await?;

        let mut entries = Vec::with_capacity(raw.len());
        for (id, mut fields) in raw {
            let value = fields.remove(PAYLOAD_FIELD).ok_or_else(|| {
                GatewayError::Store(format!("stream entry {} missing payload field", id))
            })?;
            let payload: String = redis::from_redis_value(&value).map_err(|e| {
                GatewayError::Store(format!("stream entry {} unreadable: {}", id, e))
            })?;
            entries.push(StreamEntry { id, payload });
        }
        Ok(entries)
    }

    pub async fn ack(&self, entry_id: &str) -> GatewayResult<()> {
        self.kv.stream_ack(&self.stream, &self.group, entry_id).await
    }

    pub async fn len(&self) -> GatewayResult<u64> {
        self.kv.stream_len(&self.stream).await
    }

    pub async fn oldest_pending_id(&self) -> GatewayResult<Option<String>> {
        self.kv
            .stream_oldest_pending(&self.stream, &self.group)
            .await
    }

    pub async fn trim_to_min_id(&self, min_id: &str) -> GatewayResult<u64> {
        self.kv.stream_trim_min_id(&self.stream, min_id).await
    }

    pub async fn trim_to_max_len(&self, max_len: usize) -> GatewayResult<u64> {
        self.kv.stream_trim_max_len(&self.stream, max_len).await
    }

    pub async fn delete_consumer(&self, consumer: &str) -> GatewayResult<u64> {
        self.kv
            .stream_delete_consumer(&self.stream, &self.group, consumer)
            .await
    }
}

/// Outcome records keyed by ticket id.
#[derive(Clone)]
pub struct OutcomeStore {
    kv: KvClient,
}

impl OutcomeStore {
    pub fn new(kv: KvClient) -> Self {
        Self { kv }
    }

    pub async fn record(&self, ticket_id: &str, outcome: &Outcome) -> GatewayResult<()> {
        let json = serde_json::to_string(outcome)?;
        self.kv
            .set_with_ttl(&response_key(ticket_id), &json, OUTCOME_TTL_SECS)
            .await
    }

    pub async fn get(&self, ticket_id: &str) -> GatewayResult<Option<Outcome>> {
        match self.kv.get_string(&response_key(ticket_id)).await? {
            Some(json) => {
                let outcome = serde_json::from_str(&json)?;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }
}
