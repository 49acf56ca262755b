//! In-memory outbox store.
//!
//! Used for tests and single-process deployments that accept losing the
//! queue on restart. All mutations happen inside one mutex section, which is
//! what makes `claim_batch` atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sr_common::{
    add_std, EnqueueResult, EntryStatus, LastError, NewEntry, OutboxEntry, StatusCounts,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::{OutboxError, Result};
use crate::store::{new_claim_token, OutboxStore};

type IdempotencyKey = (String, String);

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, OutboxEntry>,
    /// `(channel_id, event_key)` of every live entry, mapped to its id.
    live: HashMap<IdempotencyKey, String>,
}

impl Inner {
    fn live_holder(&self, channel_id: &str, event_key: &str) -> Option<&OutboxEntry> {
        self.live
            .get(&key_of(channel_id, event_key))
            .and_then(|id| self.entries.get(id))
    }

    /// Look up an entry held by `token`, or explain why it is not.
    fn claimed(&mut self, id: &str, token: &str) -> Result<&mut OutboxEntry> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        if !entry.is_claimed_by(token) {
            return Err(OutboxError::ClaimLost(id.to_string()));
        }
        Ok(entry)
    }
}

#[derive(Debug, Default)]
pub struct MemoryOutboxStore {
    inner: Mutex<Inner>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

fn key_of(channel_id: &str, event_key: &str) -> IdempotencyKey {
    (channel_id.to_string(), event_key.to_string())
}

fn unclaim(entry: &mut OutboxEntry, status: EntryStatus, now: DateTime<Utc>) {
    entry.status = status;
    entry.claim_token = None;
    entry.claimed_at = None;
    entry.updated_at = now;
}

fn oldest_first(entries: &mut [OutboxEntry]) {
    entries.sort_by(|a, b| {
        a.next_retry_at
            .cmp(&b.next_retry_at)
            .then(a.created_at.cmp(&b.created_at))
    });
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn enqueue(&self, entry: NewEntry, now: DateTime<Utc>) -> Result<EnqueueResult> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.live_holder(&entry.channel_id, &entry.event_key) {
            return Ok(EnqueueResult {
                id: existing.id.clone(),
                inserted: false,
            });
        }

        let entry = OutboxEntry::new(entry, now);
        let id = entry.id.clone();
        inner
            .live
            .insert(key_of(&entry.channel_id, &entry.event_key), id.clone());
        inner.entries.insert(id.clone(), entry);
        Ok(EnqueueResult { id, inserted: true })
    }

    async fn claim_batch(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        let mut inner = self.inner.lock();

        let mut eligible: Vec<&OutboxEntry> = inner
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending && e.next_retry_at <= now)
            .collect();
        eligible.sort_by(|a, b| {
            a.next_retry_at
                .cmp(&b.next_retry_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        let ids: Vec<String> = eligible
            .into_iter()
            .take(limit as usize)
            .map(|e| e.id.clone())
            .collect();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let token = new_claim_token();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.status = EntryStatus::Sending;
                entry.claim_token = Some(token.clone());
                entry.claimed_at = Some(now);
                entry.updated_at = now;
                claimed.push(entry.clone());
            }
        }

        debug!(count = claimed.len(), "Claimed outbox batch");
        Ok(claimed)
    }

    async fn renew_claim(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.claimed(id, token)?;
        entry.claimed_at = Some(now);
        entry.updated_at = now;
        Ok(())
    }

    async fn complete(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.entries.get(id).map(|e| e.status) == Some(EntryStatus::Done) {
            return Ok(false);
        }

        let entry = inner.claimed(id, token)?;
        entry.attempts += 1;
        unclaim(entry, EntryStatus::Done, now);
        Ok(true)
    }

    async fn fail(
        &self,
        id: &str,
        token: &str,
        error: &LastError,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.claimed(id, token)?;
        entry.retry_count += 1;
        entry.attempts += 1;
        entry.last_error = Some(error.clone());
        entry.next_retry_at = next_retry_at;
        unclaim(entry, EntryStatus::Pending, now);
        Ok(())
    }

    async fn defer(
        &self,
        id: &str,
        token: &str,
        error: &LastError,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.claimed(id, token)?;
        entry.attempts += 1;
        entry.last_error = Some(error.clone());
        entry.next_retry_at = next_retry_at;
        unclaim(entry, EntryStatus::Pending, now);
        Ok(())
    }

    async fn release(
        &self,
        id: &str,
        token: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.claimed(id, token)?;
        entry.next_retry_at = next_retry_at;
        unclaim(entry, EntryStatus::Pending, now);
        Ok(())
    }

    async fn send_to_dlq(
        &self,
        id: &str,
        token: &str,
        error: &LastError,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.claimed(id, token)?;
        entry.attempts += 1;
        entry.last_error = Some(error.clone());
        unclaim(entry, EntryStatus::Dlq, now);
        let key = key_of(&entry.channel_id, &entry.event_key);
        inner.live.remove(&key);
        Ok(())
    }

    async fn list_dlq_page(&self, offset: u32, limit: u32) -> Result<Vec<OutboxEntry>> {
        let inner = self.inner.lock();
        let mut dlq: Vec<OutboxEntry> = inner
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Dlq)
            .cloned()
            .collect();
        dlq.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.created_at.cmp(&b.created_at)));
        Ok(dlq
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn requeue_from_dlq(&self, id: &str, now: DateTime<Utc>) -> Result<OutboxEntry> {
        let mut inner = self.inner.lock();

        let key = {
            let entry = inner
                .entries
                .get(id)
                .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
            if entry.status != EntryStatus::Dlq {
                return Err(OutboxError::InvalidState {
                    id: id.to_string(),
                    status: entry.status,
                    expected: EntryStatus::Dlq,
                });
            }
            key_of(&entry.channel_id, &entry.event_key)
        };

        if let Some(active) = inner.live_holder(&key.0, &key.1) {
            return Err(OutboxError::Conflict(format!(
                "entry {} already holds ({}, {})",
                active.id, key.0, key.1
            )));
        }

        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        entry.next_retry_at = now;
        unclaim(entry, EntryStatus::Pending, now);
        let requeued = entry.clone();
        inner.live.insert(key, id.to_string());
        Ok(requeued)
    }

    async fn recover_stale_claims(&self, timeout: Duration, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut recovered = 0;

        for entry in inner.entries.values_mut() {
            let stale = entry.status == EntryStatus::Sending
                && entry
                    .claimed_at
                    .map(|at| add_std(at, timeout) < now)
                    .unwrap_or(true);
            if stale {
                unclaim(entry, EntryStatus::Pending, now);
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxEntry>> {
        Ok(self.inner.lock().entries.get(id).cloned())
    }

    async fn list_by_status(&self, status: EntryStatus, limit: u32) -> Result<Vec<OutboxEntry>> {
        let inner = self.inner.lock();
        let mut matching: Vec<OutboxEntry> = inner
            .entries
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        oldest_first(&mut matching);
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let inner = self.inner.lock();
        let mut counts = StatusCounts::default();
        for entry in inner.entries.values() {
            counts.add(entry.status, 1);
        }
        Ok(counts)
    }
}
