//! PostgreSQL Outbox Store
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so that several relay processes can
//! poll the same table without handing one entry to two workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use sr_common::{EnqueueResult, EntryStatus, LastError, NewEntry, OutboxEntry, StatusCounts};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{OutboxError, Result};
use crate::store::{from_millis, new_claim_token, to_millis, OutboxStore};

const COLUMNS: &str = "id, channel_id, event_key, payload, status, retry_count, attempts, \
                       next_retry_at, last_error, claim_token, claimed_at, created_at, updated_at";

/// PostgreSQL implementation of OutboxStore
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn parse_row(row: &PgRow) -> Result<OutboxEntry> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<EntryStatus>()
            .map_err(|e| OutboxError::InvalidData(e.to_string()))?;

        let payload: String = row.try_get("payload")?;
        let last_error: Option<String> = row.try_get("last_error")?;
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
            last_error: last_error
                .map(|raw| serde_json::from_str::<LastError>(&raw))
                .transpose()?,
            claim_token: row.try_get("claim_token")?,
            claimed_at: claimed_at.map(from_millis).transpose()?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }

    fn parse_rows(rows: &[PgRow]) -> Result<Vec<OutboxEntry>> {
        rows.iter().map(Self::parse_row).collect()
    }

    async fn miss(&self, id: &str) -> OutboxError {
        match self.get(id).await {
            Ok(Some(_)) => OutboxError::ClaimLost(id.to_string()),
            Ok(None) => OutboxError::NotFound(id.to_string()),
            Err(e) => e,
        }
    }

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
                 retry_count = retry_count + $1, attempts = attempts + $2, \
                 last_error = COALESCE($3, last_error), next_retry_at = $4, \
                 claim_token = NULL, claimed_at = NULL, updated_at = $5 \
             WHERE id = $6 AND status = 'sending' AND claim_token = $7",
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
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(&self, entry: NewEntry, now: DateTime<Utc>) -> Result<EnqueueResult> {
        let entry = OutboxEntry::new(entry, now);
        let payload = serde_json::to_string(&entry.payload)?;

        for _ in 0..3 {
            let result = sqlx::query(
                "INSERT INTO outbox_entries \
                     (id, channel_id, event_key, payload, status, retry_count, attempts, \
                      next_retry_at, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, 'pending', 0, 0, $5, $6, $7) \
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

            let existing: Option<String> = sqlx::query_scalar(
                "SELECT id FROM outbox_entries \
                 WHERE channel_id = $1 AND event_key = $2 \
                   AND status IN ('pending', 'sending', 'done')",
            )
            .bind(&entry.channel_id)
            .bind(&entry.event_key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = existing {
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
            "WITH due AS ( \
                 SELECT id FROM outbox_entries \
                 WHERE status = 'pending' AND next_retry_at <= $1 \
                 ORDER BY next_retry_at ASC, created_at ASC \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED) \
             UPDATE outbox_entries o SET status = 'sending', claim_token = $3, \
                 claimed_at = $1, updated_at = $1 \
             FROM due WHERE o.id = due.id \
             RETURNING {}",
            COLUMNS
                .split(", ")
                .map(|c| format!("o.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rows = sqlx::query(&query)
            .bind(to_millis(now))
            .bind(limit as i64)
            .bind(new_claim_token())
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Self::parse_rows(&rows)?;
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
            "UPDATE outbox_entries SET claimed_at = $1, updated_at = $1 \
             WHERE id = $2 AND status = 'sending' AND claim_token = $3",
        )
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
                 claim_token = NULL, claimed_at = NULL, updated_at = $1 \
             WHERE id = $2 AND status = 'sending' AND claim_token = $3",
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
            "UPDATE outbox_entries SET status = 'dlq', attempts = attempts + 1, last_error = $1, \
                 claim_token = NULL, claimed_at = NULL, updated_at = $2 \
             WHERE id = $3 AND status = 'sending' AND claim_token = $4",
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
             ORDER BY updated_at ASC, created_at ASC LIMIT $1 OFFSET $2",
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
            "UPDATE outbox_entries SET status = 'pending', next_retry_at = $1, \
                 claim_token = NULL, claimed_at = NULL, updated_at = $1 \
             WHERE id = $2 AND status = 'dlq' RETURNING {}",
            COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(to_millis(now))
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
                 updated_at = $1 \
             WHERE status = 'sending' AND (claimed_at IS NULL OR claimed_at < $2)",
        )
        .bind(to_millis(now))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxEntry>> {
        let query = format!("SELECT {} FROM outbox_entries WHERE id = $1", COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list_by_status(&self, status: EntryStatus, limit: u32) -> Result<Vec<OutboxEntry>> {
        let query = format!(
            "SELECT {} FROM outbox_entries WHERE status = $1 \
             ORDER BY next_retry_at ASC, created_at ASC LIMIT $2",
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
                id VARCHAR(36) PRIMARY KEY,
                channel_id VARCHAR(255) NOT NULL,
                event_key VARCHAR(512) NOT NULL,
                payload TEXT NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'pending',
                retry_count BIGINT NOT NULL DEFAULT 0,
                attempts BIGINT NOT NULL DEFAULT 0,
                next_retry_at BIGINT NOT NULL,
                last_error TEXT,
                claim_token VARCHAR(36),
                claimed_at BIGINT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
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

        info!("PostgreSQL outbox schema initialized");
        Ok(())
    }
}
