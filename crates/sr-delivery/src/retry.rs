//! Retry policy: maps a send outcome onto the next store transition.
//!
//! Classification is pure. Priority order: success, client errors, retry
//! exhaustion, provider throttling, transient failures. Provider throttling
//! is not a delivery failure: its hint is honoured verbatim and costs no
//! retry budget, but an entry whose budget is already spent is parked in the
//! DLQ whatever the outcome.

use rand::Rng;
use sr_common::{ErrorKind, LastError, OutboxEntry, SendOutcome};
use sr_config::RetryConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Complete,
    RetryAfter {
        delay: Duration,
        /// `true` consumes one unit of the retry budget (`fail`); `false`
        /// reschedules for free (`defer`).
        counts_attempt: bool,
        error: LastError,
    },
    ToDlq(LastError),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_backoff: Duration,
    max_backoff: Duration,
    max_retries: u32,
    jitter_ratio: f64,
    rate_limit_fallback: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
            max_retries: config.max_retries,
            jitter_ratio: config.jitter_ratio,
            rate_limit_fallback: config.rate_limit_fallback(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// `min(max_backoff, base_backoff * 2^n)`, saturating.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        1u32.checked_shl(retry_count)
            .and_then(|factor| self.base_backoff.checked_mul(factor))
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Backoff with the configured downward jitter applied.
    pub fn jittered_backoff(&self, retry_count: u32) -> Duration {
        let delay = self.backoff(retry_count);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let shrink = rand::rng().random::<f64>() * self.jitter_ratio;
        delay.mul_f64(1.0 - shrink)
    }

    pub fn classify(&self, outcome: &SendOutcome, entry: &OutboxEntry) -> Action {
        let code = outcome.status_code();

        match outcome {
            SendOutcome::Ok => Action::Complete,

            SendOutcome::ClientError { .. } => Action::ToDlq(
                LastError::new(ErrorKind::Permanent, outcome.describe()).with_code(code),
            ),

            _ if entry.retry_count >= self.max_retries => Action::ToDlq(
                LastError::new(
                    ErrorKind::Exhausted,
                    format!(
                        "retries exhausted after {} attempts: {}",
                        entry.retry_count,
                        outcome.describe()
                    ),
                )
                .with_code(code),
            ),

            SendOutcome::RateLimited { retry_after } => {
                let delay = retry_after.unwrap_or(self.rate_limit_fallback);
                Action::RetryAfter {
                    delay,
                    counts_attempt: false,
                    error: LastError::new(ErrorKind::RateLimited, outcome.describe())
                        .with_code(code)
                        .with_retry_after(delay),
                }
            }

            SendOutcome::ServerError { .. } | SendOutcome::Network { .. } | SendOutcome::Timeout => {
                Action::RetryAfter {
                    delay: self.jittered_backoff(entry.retry_count),
                    counts_attempt: true,
                    error: LastError::new(ErrorKind::Transient, outcome.describe()).with_code(code),
                }
            }
        }
    }
}
