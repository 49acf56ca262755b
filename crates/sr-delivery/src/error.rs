use sr_outbox::OutboxError;
use thiserror::Error;

/// Errors surfaced by the delivery components to their owners.
///
/// Per-entry delivery failures never appear here: they are classified and
/// recorded on the entry instead.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Dispatcher already started")]
    AlreadyStarted,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
