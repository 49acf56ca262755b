//! DLQ recovery sweeper.
//!
//! Periodically gives exhausted entries another chance. Only entries whose
//! terminal cause was retry exhaustion are eligible, and only after a
//! quarantine period. Entries that reached the lifetime attempt cap, and
//! permanent failures, stay in the DLQ for operators; nothing is discarded.

use serde::Serialize;
use sr_common::{elapsed_between, Clock, ErrorKind, OutboxEntry};
use sr_config::{ConfigHandle, DlqConfig};
use sr_outbox::{OutboxError, OutboxStore};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub requeued: usize,
    pub skipped_permanent: usize,
    pub skipped_quarantine: usize,
    pub skipped_cap: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eligibility {
    Eligible,
    NotExhausted,
    Quarantined,
    LifetimeCap,
}

pub struct DlqSweeper {
    store: Arc<dyn OutboxStore>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
}

impl DlqSweeper {
    pub fn new(store: Arc<dyn OutboxStore>, config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    fn eligibility(&self, entry: &OutboxEntry, dlq: &DlqConfig) -> Eligibility {
        let exhausted = entry
            .last_error
            .as_ref()
            .is_some_and(|e| e.kind == ErrorKind::Exhausted);
        if !exhausted {
            return Eligibility::NotExhausted;
        }
        if entry.attempts >= dlq.max_lifetime_attempts {
            return Eligibility::LifetimeCap;
        }
        if elapsed_between(entry.updated_at, self.clock.now()) < dlq.quarantine() {
            return Eligibility::Quarantined;
        }
        Eligibility::Eligible
    }

    /// Apply the eligibility rules to one entry. Returns `true` if requeued.
    async fn sweep_entry(&self, entry: &OutboxEntry, dlq: &DlqConfig, report: &mut SweepReport) -> bool {
        match self.eligibility(entry, dlq) {
            Eligibility::NotExhausted => report.skipped_permanent += 1,
            Eligibility::Quarantined => report.skipped_quarantine += 1,
            Eligibility::LifetimeCap => {
                report.skipped_cap += 1;
                debug!(
                    entry_id = %entry.id,
                    attempts = entry.attempts,
                    "DLQ entry reached lifetime attempt cap; left for operators"
                );
            }
            Eligibility::Eligible => match self.store.requeue_from_dlq(&entry.id, self.clock.now()).await {
                Ok(_) => {
                    report.requeued += 1;
                    info!(
                        entry_id = %entry.id,
                        channel_id = %entry.channel_id,
                        attempts = entry.attempts,
                        "Requeued exhausted entry from DLQ"
                    );
                    return true;
                }
                Err(OutboxError::Conflict(reason)) => {
                    report.conflicts += 1;
                    debug!(entry_id = %entry.id, %reason, "Skipping DLQ entry: key is live");
                }
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "Failed to requeue DLQ entry");
                }
            },
        }
        false
    }

    /// One pass over the whole DLQ, oldest first, in pages of `dlq.batch_size`.
    pub async fn sweep_once(&self) -> Result<SweepReport, OutboxError> {
        let dlq = self.config.snapshot().dlq.clone();
        let page_size = dlq.batch_size.max(1);
        let mut report = SweepReport::default();
        let mut offset = 0u32;

        loop {
            let page = self.store.list_dlq_page(offset, page_size).await?;
            if page.is_empty() {
                break;
            }
            report.scanned += page.len();

            let mut requeued_in_page = 0u32;
            for entry in &page {
                if self.sweep_entry(entry, &dlq, &mut report).await {
                    requeued_in_page += 1;
                }
            }

            if (page.len() as u32) < page_size {
                break;
            }
            // Requeued entries left the DLQ and no longer occupy offsets
            offset += page.len() as u32 - requeued_in_page;
        }

        if report.requeued > 0 {
            metrics::record_dlq_requeued(report.requeued as u64);
        }
        Ok(report)
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.snapshot().dlq.sweep_interval();
        info!(interval = ?period, "Starting DLQ sweeper");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.scanned > 0 => info!(?report, "DLQ sweep finished"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "DLQ sweep failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("DLQ sweeper shutting down");
                    break;
                }
            }
        }
    }
}
