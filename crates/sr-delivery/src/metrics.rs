//! Metrics for the delivery core
//!
//! Thin wrappers over the `metrics` facade; the binary installs the
//! Prometheus recorder. Without a recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use sr_common::StatusCounts;
use sr_outbox::OutboxStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Terminal transition of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Retry,
    Deferred,
    Dlq,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Retry => "retry",
            Outcome::Deferred => "deferred",
            Outcome::Dlq => "dlq",
        }
    }
}

/// Record a terminal transition
pub fn record_outcome(channel_id: &str, outcome: Outcome) {
    counter!(
        "sr_delivery_outcomes_total",
        "channel" => channel_id.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a Rate Limiter gate rejection
pub fn record_gate_rejection(channel_id: &str) {
    counter!(
        "sr_rate_limit_rejections_total",
        "channel" => channel_id.to_string()
    )
    .increment(1);
}

/// Record channel send latency
pub fn record_send_duration(channel_id: &str, duration: Duration) {
    histogram!(
        "sr_send_duration_seconds",
        "channel" => channel_id.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record DLQ entries requeued by the sweeper
pub fn record_dlq_requeued(count: u64) {
    counter!("sr_dlq_requeued_total").increment(count);
}

/// Update backlog and DLQ gauges
pub fn set_status_gauges(counts: &StatusCounts) {
    gauge!("sr_outbox_backlog").set(counts.pending as f64);
    gauge!("sr_outbox_sending").set(counts.sending as f64);
    gauge!("sr_dlq_size").set(counts.dlq as f64);
}

/// Periodically refreshes the store-derived gauges.
pub struct GaugeReporter {
    store: Arc<dyn OutboxStore>,
    interval: Duration,
}

impl GaugeReporter {
    pub fn new(store: Arc<dyn OutboxStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn refresh(&self) -> Option<StatusCounts> {
        match self.store.count_by_status().await {
            Ok(counts) => {
                set_status_gauges(&counts);
                debug!(
                    pending = counts.pending,
                    sending = counts.sending,
                    dlq = counts.dlq,
                    "Refreshed outbox gauges"
                );
                Some(counts)
            }
            Err(e) => {
                warn!(error = %e, "Failed to count outbox entries");
                None
            }
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use sr_common::NewEntry;
    use sr_outbox::MemoryOutboxStore;

    #[tokio::test]
    async fn test_refresh_reports_store_counts() {
        let store = Arc::new(MemoryOutboxStore::new());
        let now = Utc::now();
        for key in ["a", "b", "c"] {
            store
                .enqueue(NewEntry::new("1", key, json!({"k": key})), now)
                .await
                .unwrap();
        }
        store.claim_batch(1, now).await.unwrap();

        let reporter = GaugeReporter::new(store, Duration::from_secs(1));
        let counts = reporter.refresh().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.sending, 1);
        assert_eq!(counts.total(), 3);
    }
}
