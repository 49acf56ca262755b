//! SQLite Outbox Store
//!
//! Timestamps are stored as epoch milliseconds. The partial unique index on
//! `(channel_id, event_key)` over live statuses backs idempotent enqueue and
//! the requeue conflict check; a claim is a single `UPDATE ... RETURNING`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use sr_common::{EnqueueResult, EntryStatus, LastError, NewEntry, OutboxEntry, StatusCounts};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{OutboxError, Result};
use crate::store::{from_millis, new_claim_token, to_millis, OutboxStore};

const COLUMNS: &str = "id, channel_id, event_key, payload, status, retry_count, attempts, \
                       next_retry_at, last_error, claim_token, claimed_at, created_at, updated_at";

/// SQLite implementation of OutboxStore
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool for `url` (e.g. `sqlite://./data/outbox.db?mode=rwc`).
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_row(row: &SqliteRow) -> Result<OutboxEntry> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<EntryStatus>()
            .map_err(|e| OutboxError::InvalidData(e.to_string()))?;

        let payload: String = row.try_get("payload")?;
        let last_error: Option<String> = row.try_get("last_error")?;
        let last_error = last_error
            .map(|raw| serde_json::from_str::<LastError>(&raw))
            .transpose()?;

        let claimed_at: Option<i64> = row.try_get("claimed_at")?;

        Ok(OutboxEntry {
            id: row.try_get("id")?,
            channel_id: row.try_get("channel_id")?,
            event_key: row.try_get("event_key")?,
            payload: serde_json::from_str(&payload)?,
            status,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
            next_retry_at: from_millis(row.try_get("next_retry_at")?)?,
            last_error,
            claim_token: row.try_get("claim_token")?,
            claimed_at: claimed_at.map(from_millis).transpose()?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }

    fn parse_rows(rows: &[SqliteRow]) -> Result<Vec<OutboxEntry>> {
        rows.iter().map(Self::parse_row).collect()
    }

    async fn live_id(&self, channel_id: &str, event_key: &str) -> Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM outbox_entries \
             WHERE channel_id = ? AND event_key = ? AND status IN ('pending', 'sending', 'done')",
        )
        .bind(channel_id)
        .bind(event_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Error for a guarded update that matched no row.
    async fn miss(&self, id: &str) -> OutboxError {
        match self.get(id).await {
            Ok(Some(_)) => OutboxError::ClaimLost(id.to_string()),
            Ok(None) => OutboxError::NotFound(id.to_string()),
            Err(e) => e,
        }
    }

    /// Common `sending -> pending` write behind fail/defer/release.
    #[allow(clippy::too_many_arguments)]
    async fn reschedule(
        &self,
        id: &str,
        token: &str,
        error: Option<&LastError>,
        next_retry_at: DateTime<Utc>,
        retry_increment: i64,
        attempt_increment: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let last_error = error.map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            "UPDATE outbox_entries SET status = 'pending', \
                 retry_count = retry_count + ?, attempts = attempts + ?, \
                 last_error = COALESCE(?, last_error), next_retry_at = ?, \
                 claim_token = NULL, claimed_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'sending' AND claim_token = ?",
        )
        .bind(retry_increment)
        .bind(attempt_increment)
        .bind(last_error)
        .bind(to_millis(next_retry_at))
        .bind(to_millis(now))
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.miss(id).await);
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn enqueue(&self, entry: NewEntry, now: DateTime<Utc>) -> Result<EnqueueResult> {
        let entry = OutboxEntry::new(entry, now);
        let payload = serde_json::to_string(&entry.payload)?;

        // The live holder can leave the key between the insert and the
        // lookup (e.g. moved to the DLQ); retry the insert in that case.
        for _ in 0..3 {
            let result = sqlx::query(
                "INSERT INTO outbox_entries \
                     (id, channel_id, event_key, payload, status, retry_count, attempts, \
                      next_retry_at, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, 'pending', 0, 0, ?, ?, ?) \
                 ON CONFLICT (channel_id, event_key) \
                     WHERE status IN ('pending', 'sending', 'done') DO NOTHING",
            )
            .bind(&entry.id)
            .bind(&entry.channel_id)
            .bind(&entry.event_key)
            .bind(&payload)
            .bind(to_millis(entry.next_retry_at))
            .bind(to_millis(entry.created_at))
            .bind(to_millis(entry.updated_at))
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(EnqueueResult {
                    id: entry.id,
                    inserted: true,
                });
            }

            if let Some(id) = self.live_id(&entry.channel_id, &entry.event_key).await? {
                return Ok(EnqueueResult { id, inserted: false });
            }
        }

        Err(OutboxError::Conflict(format!(
            "could not settle ({}, {})",
            entry.channel_id, entry.event_key
        )))
    }

    async fn claim_batch(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query = format!(
            "UPDATE outbox_entries SET status = 'sending', claim_token = ?, claimed_at = ?, updated_at = ? \
             WHERE id IN ( \
                 SELECT id FROM outbox_entries \
                 WHERE status = 'pending' AND next_retry_at <= ? \
                 ORDER BY next_retry_at ASC, created_at ASC LIMIT ?) \
             RETURNING {}",
            COLUMNS
        );

        let now_ms = to_millis(now);
        let rows = sqlx::query(&query)
            .bind(new_claim_token())
            .bind(now_ms)
            .bind(now_ms)
            .bind(now_ms)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Self::parse_rows(&rows)?;
        // RETURNING order is unspecified
        entries.sort_by(|a, b| {
            a.next_retry_at
                .cmp(&b.next_retry_at)
                .then(a.created_at.cmp(&b.created_at))
        });

        debug!(count = entries.len(), "Claimed outbox batch");
        Ok(entries)
    }

    async fn renew_claim(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<()> {
        let now_ms = to_millis(now);
        let result = sqlx::query(
            "UPDATE outbox_entries SET claimed_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'sending' AND claim_token = ?",
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.miss(id).await);
        }
        Ok(())
    }

    async fn complete(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox_entries SET status = 'done', attempts = attempts + 1, \
                 claim_token = NULL, claimed_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'sending' AND claim_token = ?",
        )
        .bind(to_millis(now))
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get(id).await? {
            Some(entry) if entry.status == EntryStatus::Done => Ok(false),
            Some(_) => Err(OutboxError::ClaimLost(id.to_string())),
            None => Err(OutboxError::NotFound(id.to_string())),
        }
    }

    async fn fail(
        &self,
        id: &str,
        token: &str,
        error: &LastError,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.reschedule(id, token, Some(error), next_retry_at, 1, 1, now)
            .await
    }

    async fn defer(
        &self,
        id: &str,
        token: &str,
        error: &LastError,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.reschedule(id, token, Some(error), next_retry_at, 0, 1, now)
            .await
    }

    async fn release(
        &self,
        id: &str,
        token: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.reschedule(id, token, None, next_retry_at, 0, 0, now)
            .await
    }

    async fn send_to_dlq(
        &self,
        id: &str,
        token: &str,
        error: &LastError,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox_entries SET status = 'dlq', attempts = attempts + 1, last_error = ?, \
                 claim_token = NULL, claimed_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'sending' AND claim_token = ?",
        )
        .bind(serde_json::to_string(error)?)
        .bind(to_millis(now))
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.miss(id).await);
        }
        Ok(())
    }

    async fn list_dlq_page(&self, offset: u32, limit: u32) -> Result<Vec<OutboxEntry>> {
        let query = format!(
            "SELECT {} FROM outbox_entries WHERE status = 'dlq' \
             ORDER BY updated_at ASC, created_at ASC LIMIT ? OFFSET ?",
            COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        Self::parse_rows(&rows)
    }

    async fn requeue_from_dlq(&self, id: &str, now: DateTime<Utc>) -> Result<OutboxEntry> {
        let query = format!(
            "UPDATE outbox_entries SET status = 'pending', next_retry_at = ?, \
                 claim_token = NULL, claimed_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'dlq' RETURNING {}",
            COLUMNS
        );

        let now_ms = to_millis(now);
        let row = sqlx::query(&query)
            .bind(now_ms)
            .bind(now_ms)
            .bind(id)
            .fetch_optional(&self.pool)
            .await;

        match row {
            Ok(Some(row)) => Self::parse_row(&row),
            Ok(None) => match self.get(id).await? {
                Some(entry) => Err(OutboxError::InvalidState {
                    id: id.to_string(),
                    status: entry.status,
                    expected: EntryStatus::Dlq,
                }),
                None => Err(OutboxError::NotFound(id.to_string())),
            },
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                OutboxError::Conflict(format!("another live entry holds the key of {}", id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn recover_stale_claims(&self, timeout: Duration, now: DateTime<Utc>) -> Result<u64> {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = to_millis(now).saturating_sub(timeout_ms);

        let result = sqlx::query(
            "UPDATE outbox_entries SET status = 'pending', claim_token = NULL, claimed_at = NULL, \
                 updated_at = ? \
             WHERE status = 'sending' AND (claimed_at IS NULL OR claimed_at < ?)",
        )
        .bind(to_millis(now))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxEntry>> {
        let query = format!("SELECT {} FROM outbox_entries WHERE id = ?", COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list_by_status(&self, status: EntryStatus, limit: u32) -> Result<Vec<OutboxEntry>> {
        let query = format!(
            "SELECT {} FROM outbox_entries WHERE status = ? \
             ORDER BY next_retry_at ASC, created_at ASC LIMIT ?",
            COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Self::parse_rows(&rows)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM outbox_entries GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let status = status
                .parse::<EntryStatus>()
                .map_err(|e| OutboxError::InvalidData(e.to_string()))?;
            counts.add(status, n as u64);
        }
        Ok(counts)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_entries (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                event_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_retry_at INTEGER NOT NULL,
                last_error TEXT,
                claim_token TEXT,
                claimed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_outbox_live_key \
             ON outbox_entries(channel_id, event_key) \
             WHERE status IN ('pending', 'sending', 'done')",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox_entries(status, next_retry_at, created_at)",
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite outbox schema initialized");
        Ok(())
    }
}
