//! Stale-claim recovery.
//!
//! A worker that dies between `claim_batch` and its transition leaves entries
//! in `sending`. This task periodically returns claims older than
//! `delivery.stuck_claim_timeout` to `pending`; the claim token is cleared so
//! the original worker, if it is merely slow, loses the right to finish them.

use sr_common::Clock;
use sr_config::ConfigHandle;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::store::OutboxStore;

/// Background task that recovers stale `sending` claims.
pub struct RecoveryTask {
    store: Arc<dyn OutboxStore>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
}

impl RecoveryTask {
    pub fn new(store: Arc<dyn OutboxStore>, config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    /// Run until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let delivery = self.config.snapshot().delivery.clone();
        info!(
            interval = ?delivery.recovery_interval(),
            timeout = ?delivery.stuck_claim_timeout(),
            "Starting stale-claim recovery task"
        );

        let mut ticker = interval(delivery.recovery_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.recover_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Stale-claim recovery task shutting down");
                    break;
                }
            }
        }
    }

    /// Perform a single recovery pass and return the number of entries reset.
    pub async fn recover_once(&self) -> u64 {
        let timeout = self.config.snapshot().delivery.stuck_claim_timeout();
        debug!("Checking for stale outbox claims");

        match self.store.recover_stale_claims(timeout, self.clock.now()).await {
            Ok(0) => 0,
            Ok(count) => {
                warn!(count, "Recovered stale outbox claims");
                metrics::counter!("sr_stale_claims_recovered_total").increment(count);
                count
            }
            Err(e) => {
                error!(error = %e, "Failed to recover stale outbox claims");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryOutboxStore;
    use chrono::Utc;
    use serde_json::json;
    use sr_common::{EntryStatus, ManualClock, NewEntry};
    use sr_config::RelayConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_recover_once_only_touches_stale_claims() {
        let store = Arc::new(MemoryOutboxStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = ConfigHandle::new(RelayConfig::default()).unwrap();
        let task = RecoveryTask::new(store.clone(), config, clock.clone());

        let id = store
            .enqueue(NewEntry::new("1", "evt:A", json!("x")), clock.now())
            .await
            .unwrap()
            .id;
        store.claim_batch(1, clock.now()).await.unwrap();

        clock.advance(Duration::from_secs(60));
        assert_eq!(task.recover_once().await, 0);

        clock.advance(Duration::from_secs(300));
        assert_eq!(task.recover_once().await, 1);

        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert!(entry.claim_token.is_none());
        assert_eq!(entry.retry_count, 0);
    }
}
