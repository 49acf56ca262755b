//! Dispatcher worker pool.
//!
//! Each worker claims a batch, gates every entry on the rate limiter, sends
//! it under a timeout, classifies the outcome and applies the resulting store
//! transition. A failure on one entry is logged and counted; it never aborts
//! the rest of the batch.
//!
//! On shutdown a worker finishes the send it is in, releases the rest of its
//! claimed batch back to `pending` and exits.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sr_common::{add_std, Clock, LivenessSource, OutboxEntry, SendOutcome};
use sr_config::ConfigHandle;
use sr_outbox::{OutboxError, OutboxStore, RecoveryTask};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::channel::ChannelClient;
use crate::error::{DeliveryError, Result};
use crate::metrics::{self, Outcome};
use crate::rate_limiter::RateLimiter;
use crate::retry::{Action, RetryPolicy};

/// In-process dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    claimed: AtomicU64,
    done: AtomicU64,
    retried: AtomicU64,
    deferred: AtomicU64,
    dlq: AtomicU64,
    gate_rejected: AtomicU64,
    released: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub claimed: u64,
    pub done: u64,
    pub retried: u64,
    pub deferred: u64,
    pub dlq: u64,
    pub gate_rejected: u64,
    pub released: u64,
    pub store_errors: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dlq: self.dlq.load(Ordering::Relaxed),
            gate_rejected: self.gate_rejected.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// State shared by all workers of one dispatcher.
struct DispatchContext {
    store: Arc<dyn OutboxStore>,
    client: Arc<dyn ChannelClient>,
    limiter: Arc<RateLimiter>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    started: AtomicBool,
    stopping: AtomicBool,
    stats: DispatchStats,
    last_progress: Mutex<Option<DateTime<Utc>>>,
}

impl DispatchContext {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_progress.lock() = Some(self.clock.now());
    }

    fn store_error(&self, entry: &OutboxEntry, op: &str, e: OutboxError) {
        DispatchStats::bump(&self.stats.store_errors, 1);
        match e {
            OutboxError::ClaimLost(_) => warn!(
                entry_id = %entry.id,
                channel_id = %entry.channel_id,
                op,
                "Claim was recovered by another worker; dropping result"
            ),
            e => error!(
                entry_id = %entry.id,
                channel_id = %entry.channel_id,
                op,
                error = %e,
                "Store transition failed"
            ),
        }
    }

    /// Claim one batch and process it. Returns the number of entries claimed.
    async fn run_once(&self) -> std::result::Result<usize, OutboxError> {
        self.touch();
        let batch_size = self.config.snapshot().delivery.batch_size;
        let batch = self.store.claim_batch(batch_size, self.clock.now()).await?;
        let claimed = batch.len();
        if claimed == 0 {
            return Ok(0);
        }

        DispatchStats::bump(&self.stats.claimed, claimed as u64);
        debug!(count = claimed, "Processing claimed batch");

        for (idx, entry) in batch.iter().enumerate() {
            if self.is_stopping() {
                self.release_all(&batch[idx..]).await;
                break;
            }
            self.process_entry(entry).await;
            self.touch();
        }

        Ok(claimed)
    }

    /// Hand unsent claims back, eligible immediately.
    async fn release_all(&self, entries: &[OutboxEntry]) {
        let now = self.clock.now();
        for entry in entries {
            match self.store.release(&entry.id, entry.token(), now, now).await {
                Ok(()) => DispatchStats::bump(&self.stats.released, 1),
                Err(e) => self.store_error(entry, "release", e),
            }
        }
        if !entries.is_empty() {
            info!(count = entries.len(), "Released unsent claims on shutdown");
        }
    }

    async fn process_entry(&self, entry: &OutboxEntry) {
        let now = self.clock.now();
        // Entries late in a batch have waited for every send before them
        if let Err(e) = self.store.renew_claim(&entry.id, entry.token(), now).await {
            self.store_error(entry, "renew_claim", e);
            return;
        }

        let decision = self.limiter.allow(&entry.channel_id, now);
        if !decision.allowed {
            DispatchStats::bump(&self.stats.gate_rejected, 1);
            metrics::record_gate_rejection(&entry.channel_id);
            debug!(
                entry_id = %entry.id,
                channel_id = %entry.channel_id,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit gate rejected send"
            );
            let next = add_std(now, decision.retry_after);
            if let Err(e) = self.store.release(&entry.id, entry.token(), next, now).await {
                self.store_error(entry, "release", e);
            }
            return;
        }

        let config = self.config.snapshot();
        let started = Instant::now();
        let outcome = match timeout(config.delivery.send_timeout(), self.client.send(entry)).await {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::Timeout,
        };
        metrics::record_send_duration(&entry.channel_id, started.elapsed());

        let policy = RetryPolicy::new(&config.retry);
        let now = self.clock.now();

        match policy.classify(&outcome, entry) {
            Action::Complete => match self.store.complete(&entry.id, entry.token(), now).await {
                Ok(true) => {
                    DispatchStats::bump(&self.stats.done, 1);
                    metrics::record_outcome(&entry.channel_id, Outcome::Done);
                    info!(
                        entry_id = %entry.id,
                        channel_id = %entry.channel_id,
                        event_key = %entry.event_key,
                        "Delivered"
                    );
                }
                Ok(false) => debug!(
                    entry_id = %entry.id,
                    channel_id = %entry.channel_id,
                    "Entry was already delivered"
                ),
                Err(e) => self.store_error(entry, "complete", e),
            },
            Action::RetryAfter {
                delay,
                counts_attempt: true,
                error,
            } => {
                let next = add_std(now, delay);
                match self.store.fail(&entry.id, entry.token(), &error, next, now).await {
                    Ok(()) => {
                        DispatchStats::bump(&self.stats.retried, 1);
                        metrics::record_outcome(&entry.channel_id, Outcome::Retry);
                        warn!(
                            entry_id = %entry.id,
                            channel_id = %entry.channel_id,
                            retry_count = entry.retry_count + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %error.message,
                            "Send failed, retry scheduled"
                        );
                    }
                    Err(e) => self.store_error(entry, "fail", e),
                }
            }
            Action::RetryAfter {
                delay,
                counts_attempt: false,
                error,
            } => {
                let next = add_std(now, delay);
                match self.store.defer(&entry.id, entry.token(), &error, next, now).await {
                    Ok(()) => {
                        DispatchStats::bump(&self.stats.deferred, 1);
                        metrics::record_outcome(&entry.channel_id, Outcome::Deferred);
                        info!(
                            entry_id = %entry.id,
                            channel_id = %entry.channel_id,
                            delay_ms = delay.as_millis() as u64,
                            "Channel throttled, send deferred"
                        );
                    }
                    Err(e) => self.store_error(entry, "defer", e),
                }
            }
            Action::ToDlq(error) => {
                match self.store.send_to_dlq(&entry.id, entry.token(), &error, now).await {
                    Ok(()) => {
                        DispatchStats::bump(&self.stats.dlq, 1);
                        metrics::record_outcome(&entry.channel_id, Outcome::Dlq);
                        warn!(
                            entry_id = %entry.id,
                            channel_id = %entry.channel_id,
                            event_key = %entry.event_key,
                            retry_count = entry.retry_count,
                            kind = %error.kind,
                            error = %error.message,
                            "Entry moved to DLQ"
                        );
                    }
                    Err(e) => self.store_error(entry, "send_to_dlq", e),
                }
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: broadcast::Receiver<()>) {
        debug!(worker_id, "Dispatcher worker started");

        while !self.is_stopping() {
            let idle = match self.run_once().await {
                Ok(claimed) => claimed == 0,
                Err(e) => {
                    DispatchStats::bump(&self.stats.store_errors, 1);
                    error!(worker_id, error = %e, "Failed to claim batch");
                    true
                }
            };

            if idle {
                let poll = self.config.snapshot().delivery.poll_interval();
                tokio::select! {
                    _ = sleep(poll) => {}
                    _ = shutdown.recv() => break,
                }
            }
        }

        debug!(worker_id, "Dispatcher worker stopped");
    }
}

pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        client: Arc<dyn ChannelClient>,
        limiter: Arc<RateLimiter>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            ctx: Arc::new(DispatchContext {
                store,
                client,
                limiter,
                config,
                clock,
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                stats: DispatchStats::default(),
                last_progress: Mutex::new(None),
            }),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool and the stale-claim recovery loop.
    pub fn start(&self) -> Result<()> {
        if self.ctx.started.swap(true, Ordering::SeqCst) {
            return Err(DeliveryError::AlreadyStarted);
        }

        let workers = self.ctx.config.snapshot().delivery.workers;
        info!(workers, "Starting dispatcher");
        self.ctx.touch();

        let mut handles = self.handles.lock();
        for worker_id in 0..workers {
            let ctx = Arc::clone(&self.ctx);
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(ctx.worker_loop(worker_id, shutdown)));
        }

        let recovery = RecoveryTask::new(
            Arc::clone(&self.ctx.store),
            self.ctx.config.clone(),
            Arc::clone(&self.ctx.clock),
        );
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { recovery.run(shutdown).await }));

        Ok(())
    }

    /// Claim and process a single batch on the calling task. Returns the
    /// number of entries claimed.
    pub async fn run_once(&self) -> Result<usize> {
        Ok(self.ctx.run_once().await?)
    }

    /// Stop the workers and wait up to `delivery.shutdown_grace` for them.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Dispatcher shutting down");
        self.ctx.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let grace = self.ctx.config.snapshot().delivery.shutdown_grace();

        match timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("Dispatcher stopped");
                Ok(())
            }
            Err(_) => {
                warn!(?grace, "Dispatcher workers did not stop within grace period");
                Err(DeliveryError::ShutdownTimeout(grace))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.ctx.started.load(Ordering::SeqCst) && !self.ctx.is_stopping()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.ctx.stats.snapshot()
    }
}

impl LivenessSource for Dispatcher {
    fn last_progress(&self) -> Option<DateTime<Utc>> {
        *self.ctx.last_progress.lock()
    }
}
