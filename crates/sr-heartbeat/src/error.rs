//! Error types for the heartbeat module

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeartbeatError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis operation error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Restart hook failed: {0}")]
    RestartFailed(String),
}

pub type Result<T> = std::result::Result<T, HeartbeatError>;
