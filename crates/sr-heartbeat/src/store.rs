//! Heartbeat record storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::{HeartbeatError, Result};

/// Last liveness signal of a scheduling process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub source_id: String,
    pub last_beat_at: DateTime<Utc>,
}

impl HeartbeatRecord {
    pub fn new(source_id: impl Into<String>, last_beat_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            last_beat_at,
        }
    }
}

#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Write `record`. `ttl` is the staleness threshold; stores that expire
    /// keys keep the record for longer so a stale beat stays observable.
    async fn beat(&self, record: &HeartbeatRecord, ttl: Duration) -> Result<()>;

    async fn last_beat(&self, source_id: &str) -> Result<Option<HeartbeatRecord>>;
}

/// Process-local store for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryHeartbeatStore {
    records: Mutex<HashMap<String, HeartbeatRecord>>,
}

impl MemoryHeartbeatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HeartbeatStore for MemoryHeartbeatStore {
    async fn beat(&self, record: &HeartbeatRecord, _ttl: Duration) -> Result<()> {
        self.records
            .lock()
            .insert(record.source_id.clone(), record.clone());
        Ok(())
    }

    async fn last_beat(&self, source_id: &str) -> Result<Option<HeartbeatRecord>> {
        Ok(self.records.lock().get(source_id).cloned())
    }
}

/// Redis-backed store shared between the scheduler and its monitor.
pub struct RedisHeartbeatStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisHeartbeatStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| HeartbeatError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key_prefix: "sr:heartbeat:".to_string(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, source_id: &str) -> String {
        format!("{}{}", self.key_prefix, source_id)
    }
}

#[async_trait]
impl HeartbeatStore for RedisHeartbeatStore {
    async fn beat(&self, record: &HeartbeatRecord, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(record)?;
        // Keep the key past the TTL so a stale beat reads as stalled, not missing
        let expire_secs = (ttl.as_secs() * 2).max(1);

        let _: () = redis::cmd("SET")
            .arg(self.key(&record.source_id))
            .arg(payload)
            .arg("EX")
            .arg(expire_secs)
            .query_async(&mut conn)
            .await?;

        debug!(source_id = %record.source_id, "Heartbeat written");
        Ok(())
    }

    async fn last_beat(&self, source_id: &str) -> Result<Option<HeartbeatRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(source_id))
            .query_async(&mut conn)
            .await?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(HeartbeatError::from))
            .transpose()
    }
}
