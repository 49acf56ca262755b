use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod clock;
pub mod logging;

pub use clock::{add_std, elapsed_between, Clock, ManualClock, SystemClock};

// ============================================================================
// Outbox Entry Types
// ============================================================================

/// Delivery state of an outbox entry.
///
/// `pending -> sending -> {done | pending | dlq}`; `dlq -> pending` only via
/// explicit requeue. `Failed` is the logical state between a failed attempt
/// and its reschedule; the bundled stores collapse it into a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Sending,
    Done,
    Failed,
    Dlq,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 5] = [
        EntryStatus::Pending,
        EntryStatus::Sending,
        EntryStatus::Done,
        EntryStatus::Failed,
        EntryStatus::Dlq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Sending => "sending",
            EntryStatus::Done => "done",
            EntryStatus::Failed => "failed",
            EntryStatus::Dlq => "dlq",
        }
    }

    /// Terminal states accept no further mutation from the dispatcher.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Done | EntryStatus::Dlq)
    }

    /// Statuses that hold the `(channel_id, event_key)` idempotency key.
    pub fn holds_idempotency_key(&self) -> bool {
        matches!(self, EntryStatus::Pending | EntryStatus::Sending | EntryStatus::Done)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown entry status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for EntryStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(EntryStatus::Pending),
            "sending" => Ok(EntryStatus::Sending),
            "done" => Ok(EntryStatus::Done),
            "failed" => Ok(EntryStatus::Failed),
            "dlq" => Ok(EntryStatus::Dlq),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Classified delivery error kinds recorded on entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad enqueue input. Never stored on an entry.
    Validation,
    /// Gate rejection or provider 429. Retried at the hinted time for free.
    RateLimited,
    /// Network, server or timeout failure. Retried with capped backoff.
    Transient,
    /// Non-retryable client error. Routed straight to the DLQ.
    Permanent,
    /// Retry budget consumed. Routed to the DLQ.
    Exhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last classified error of an entry, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl LastError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_code(mut self, code: Option<u16>) -> Self {
        self.code = code;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }
}

/// One delivery unit in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub channel_id: String,
    pub event_key: String,
    pub payload: serde_json::Value,
    pub status: EntryStatus,
    pub retry_count: u32,
    /// Channel invocations over the entry's lifetime (gate rejections excluded).
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<LastError>,
    /// Receipt handle of the current claim; only set while `sending`.
    pub claim_token: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// Build a fresh `pending` entry, eligible immediately.
    pub fn new(new_entry: NewEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: new_entry.channel_id,
            event_key: new_entry.event_key,
            payload: new_entry.payload,
            status: EntryStatus::Pending,
            retry_count: 0,
            attempts: 0,
            next_retry_at: now,
            last_error: None,
            claim_token: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `token` is the receipt handle of the live claim on this entry.
    pub fn is_claimed_by(&self, token: &str) -> bool {
        self.status == EntryStatus::Sending && self.claim_token.as_deref() == Some(token)
    }

    /// The claim token, or an empty string when the entry is not claimed.
    pub fn token(&self) -> &str {
        self.claim_token.as_deref().unwrap_or_default()
    }
}

/// Input of an enqueue call, as produced by the card-rendering collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub channel_id: String,
    pub event_key: String,
    pub payload: serde_json::Value,
}

impl NewEntry {
    pub fn new(
        channel_id: impl Into<String>,
        event_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            event_key: event_key.into(),
            payload,
        }
    }
}

/// Result of an enqueue: the id of the live entry and whether it was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub id: String,
    pub inserted: bool,
}

/// Whether a payload carries nothing worth sending.
pub fn payload_is_empty(payload: &serde_json::Value) -> bool {
    match payload {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Entry counts per status, used for backlog and DLQ gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub sending: u64,
    pub done: u64,
    pub failed: u64,
    pub dlq: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: EntryStatus, count: u64) {
        match status {
            EntryStatus::Pending => self.pending += count,
            EntryStatus::Sending => self.sending += count,
            EntryStatus::Done => self.done += count,
            EntryStatus::Failed => self.failed += count,
            EntryStatus::Dlq => self.dlq += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.sending + self.done + self.failed + self.dlq
    }
}

// ============================================================================
// Liveness
// ============================================================================

/// Reports when a long-running loop last made progress.
///
/// The heartbeat writer only beats while its source keeps reporting recent
/// progress, so a wedged loop stops the heartbeat even if the timer task
/// that writes it is still alive.
pub trait LivenessSource: Send + Sync {
    fn last_progress(&self) -> Option<DateTime<Utc>>;
}

// ============================================================================
// Channel Send Outcome
// ============================================================================

/// Outcome of one `send` against the downstream channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    /// Provider throttled us; `retry_after` is its explicit hint, if any.
    RateLimited { retry_after: Option<Duration> },
    ClientError { code: u16, message: String },
    ServerError { code: u16, message: String },
    Network { message: String },
    /// The send deadline expired before the channel answered.
    Timeout,
}

impl SendOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, SendOutcome::Ok)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SendOutcome::Ok => "ok",
            SendOutcome::RateLimited { .. } => "rate_limited",
            SendOutcome::ClientError { .. } => "client_error",
            SendOutcome::ServerError { .. } => "server_error",
            SendOutcome::Network { .. } => "network",
            SendOutcome::Timeout => "timeout",
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            SendOutcome::ClientError { code, .. } | SendOutcome::ServerError { code, .. } => Some(*code),
            SendOutcome::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SendOutcome::Ok => "delivered".to_string(),
            SendOutcome::RateLimited { retry_after: Some(d) } => {
                format!("rate limited, retry after {}ms", d.as_millis())
            }
            SendOutcome::RateLimited { retry_after: None } => "rate limited".to_string(),
            SendOutcome::ClientError { code, message } => format!("HTTP {}: {}", code, message),
            SendOutcome::ServerError { code, message } => format!("HTTP {}: {}", code, message),
            SendOutcome::Network { message } => format!("network error: {}", message),
            SendOutcome::Timeout => "send timed out".to_string(),
        }
    }
}
