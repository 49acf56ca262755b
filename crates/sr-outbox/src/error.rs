use sr_common::EntryStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entry not found: {0}")]
    NotFound(String),

    /// The presented claim token no longer owns the entry.
    #[error("Claim lost for entry {0}")]
    ClaimLost(String),

    #[error("Entry {id} is {status}, expected {expected}")]
    InvalidState {
        id: String,
        status: EntryStatus,
        expected: EntryStatus,
    },

    /// Another live entry already holds the `(channel_id, event_key)` key.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl OutboxError {
    pub fn is_validation(&self) -> bool {
        matches!(self, OutboxError::Validation(_))
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl From<sqlx::Error> for OutboxError {
    fn from(e: sqlx::Error) -> Self {
        OutboxError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OutboxError>;
