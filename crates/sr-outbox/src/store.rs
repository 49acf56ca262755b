//! Outbox Store Trait
//!
//! Persistence interface for the delivery queue. Every transition out of
//! `sending` is guarded by the claim token handed out by `claim_batch`, so a
//! worker whose claim was recovered and re-issued can no longer mutate the
//! entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sr_common::{EnqueueResult, EntryStatus, LastError, NewEntry, OutboxEntry, StatusCounts};
use std::time::Duration;

use crate::error::Result;

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a `pending` entry unless a live entry (`pending`, `sending` or
    /// `done`) already holds the same `(channel_id, event_key)`; in that case
    /// return the existing id with `inserted = false`.
    async fn enqueue(&self, entry: NewEntry, now: DateTime<Utc>) -> Result<EnqueueResult>;

    /// Atomically move up to `limit` eligible `pending` entries to `sending`,
    /// oldest `next_retry_at` first. No entry is returned to two callers.
    async fn claim_batch(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>>;

    /// Restart the stale-claim clock of one claimed entry. Called right
    /// before each send so entries late in a batch are never recovered and
    /// re-issued while their first claimant is still about to send them.
    /// `ClaimLost` once the token no longer holds.
    async fn renew_claim(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<()>;

    /// `sending -> done`. Returns `false` when the entry was already `done`.
    async fn complete(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Failed attempt: `sending -> pending` with `retry_count + 1`.
    async fn fail(
        &self,
        id: &str,
        token: &str,
        error: &LastError,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Provider throttling: `sending -> pending` without touching `retry_count`.
    async fn defer(
        &self,
        id: &str,
        token: &str,
        error: &LastError,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Hand a claim back untouched (gate rejection, shutdown).
    async fn release(
        &self,
        id: &str,
        token: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// `sending -> dlq`, recording the terminal error.
    async fn send_to_dlq(
        &self,
        id: &str,
        token: &str,
        error: &LastError,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// DLQ entries, oldest first.
    async fn list_dlq(&self, limit: u32) -> Result<Vec<OutboxEntry>> {
        self.list_dlq_page(0, limit).await
    }

    /// DLQ entries, oldest first, skipping the first `offset`.
    async fn list_dlq_page(&self, offset: u32, limit: u32) -> Result<Vec<OutboxEntry>>;

    /// `dlq -> pending`, eligible immediately. Refused with `Conflict` when
    /// another live entry holds the same key.
    async fn requeue_from_dlq(&self, id: &str, now: DateTime<Utc>) -> Result<OutboxEntry>;

    /// Return `sending` entries claimed more than `timeout` ago to `pending`.
    async fn recover_stale_claims(&self, timeout: Duration, now: DateTime<Utc>) -> Result<u64>;

    async fn get(&self, id: &str) -> Result<Option<OutboxEntry>>;

    async fn list_by_status(&self, status: EntryStatus, limit: u32) -> Result<Vec<OutboxEntry>>;

    async fn count_by_status(&self) -> Result<StatusCounts>;

    /// Create tables and indexes if missing.
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }
}

/// Fresh receipt handle for a claimed batch.
pub(crate) fn new_claim_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| crate::OutboxError::InvalidData(format!("timestamp out of range: {}", ms)))
}
