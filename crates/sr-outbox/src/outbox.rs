//! Inbound enqueue facade.
//!
//! Upstream producers hand rendered payloads to [`Outbox::enqueue`]. Input is
//! validated against the current configuration before the store is touched;
//! a validation failure is the only error an enqueue caller has to handle.

use serde_json::Value;
use sr_common::{payload_is_empty, Clock, EnqueueResult, EntryStatus, NewEntry, OutboxEntry, StatusCounts};
use sr_config::{ConfigHandle, RelayConfig};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{OutboxError, Result};
use crate::store::OutboxStore;

#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn OutboxStore>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
}

impl Outbox {
    pub fn new(store: Arc<dyn OutboxStore>, config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    /// Durably record a delivery, idempotent per `(channel_id, event_key)`.
    pub async fn enqueue(
        &self,
        channel_id: impl Into<String>,
        event_key: impl Into<String>,
        payload: Value,
    ) -> Result<EnqueueResult> {
        let entry = NewEntry::new(channel_id, event_key, payload);
        validate_new_entry(&entry, &self.config.snapshot())?;

        let result = self.store.enqueue(entry.clone(), self.clock.now()).await?;
        if result.inserted {
            info!(
                entry_id = %result.id,
                channel_id = %entry.channel_id,
                event_key = %entry.event_key,
                "Enqueued outbox entry"
            );
        } else {
            debug!(
                entry_id = %result.id,
                channel_id = %entry.channel_id,
                event_key = %entry.event_key,
                "Duplicate enqueue collapsed onto live entry"
            );
        }
        Ok(result)
    }

    /// Operator requeue of a DLQ entry.
    pub async fn requeue_from_dlq(&self, id: &str) -> Result<OutboxEntry> {
        let entry = self.store.requeue_from_dlq(id, self.clock.now()).await?;
        info!(entry_id = %id, channel_id = %entry.channel_id, "DLQ entry requeued by operator");
        metrics::counter!("sr_dlq_requeued_total").increment(1);
        Ok(entry)
    }

    pub async fn list_dlq(&self, limit: u32) -> Result<Vec<OutboxEntry>> {
        self.store.list_dlq(limit).await
    }

    pub async fn backlog(&self, status: EntryStatus, limit: u32) -> Result<Vec<OutboxEntry>> {
        self.store.list_by_status(status, limit).await
    }

    pub async fn counts(&self) -> Result<StatusCounts> {
        self.store.count_by_status().await
    }
}

/// Reject input that can never be delivered.
pub fn validate_new_entry(entry: &NewEntry, config: &RelayConfig) -> Result<()> {
    if entry.channel_id.trim().is_empty() {
        return Err(OutboxError::Validation("channel_id must not be empty".into()));
    }
    if entry.event_key.trim().is_empty() {
        return Err(OutboxError::Validation("event_key must not be empty".into()));
    }
    if payload_is_empty(&entry.payload) {
        return Err(OutboxError::Validation("payload must not be empty".into()));
    }
    if !config.is_known_channel(&entry.channel_id) {
        return Err(OutboxError::Validation(format!(
            "unknown channel: {}",
            entry.channel_id
        )));
    }
    Ok(())
}
