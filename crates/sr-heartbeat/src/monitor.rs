//! Heartbeat monitor.
//!
//! Reads the scheduler's heartbeat every `check_interval` and reports it
//! stalled once `age > ttl` (or once no record shows up within a TTL of the
//! monitor starting). Entering a stall invokes the [`StallHandler`]; a
//! persisting stall re-invokes it after `restart_cooldown`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sr_common::{elapsed_between, Clock};
use sr_config::ConfigHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::{HeartbeatError, Result};
use crate::store::HeartbeatStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Healthy { age: Duration },
    Stalled { age: Duration },
    Missing,
}

impl HeartbeatStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HeartbeatStatus::Healthy { .. })
    }

    pub fn age(&self) -> Option<Duration> {
        match self {
            HeartbeatStatus::Healthy { age } | HeartbeatStatus::Stalled { age } => Some(*age),
            HeartbeatStatus::Missing => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatStatus::Healthy { .. } => "healthy",
            HeartbeatStatus::Stalled { .. } => "stalled",
            HeartbeatStatus::Missing => "missing",
        }
    }
}

/// Reaction to a detected stall.
#[async_trait]
pub trait StallHandler: Send + Sync {
    async fn on_stall(&self, source_id: &str, status: HeartbeatStatus) -> Result<()>;
}

/// Only logs; restart is left to an external supervisor watching metrics.
#[derive(Debug, Default)]
pub struct LogStallHandler;

#[async_trait]
impl StallHandler for LogStallHandler {
    async fn on_stall(&self, source_id: &str, status: HeartbeatStatus) -> Result<()> {
        error!(source_id, status = status.as_str(), age = ?status.age(), "Scheduler stalled");
        Ok(())
    }
}

/// Runs a configured restart command, e.g. `["systemctl", "restart", "sr-relay"]`.
#[derive(Debug, Clone)]
pub struct CommandStallHandler {
    command: Vec<String>,
}

impl CommandStallHandler {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl StallHandler for CommandStallHandler {
    async fn on_stall(&self, source_id: &str, status: HeartbeatStatus) -> Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(HeartbeatError::RestartFailed("empty restart command".into()));
        };

        warn!(source_id, status = status.as_str(), program = %program, "Scheduler stalled, running restart command");

        let exit = tokio::process::Command::new(program)
            .args(args)
            .env("SR_STALLED_SOURCE", source_id)
            .status()
            .await
            .map_err(|e| HeartbeatError::RestartFailed(format!("{}: {}", program, e)))?;

        if exit.success() {
            info!(source_id, "Restart command completed");
            Ok(())
        } else {
            Err(HeartbeatError::RestartFailed(format!("{} exited with {}", program, exit)))
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    started_at: Option<DateTime<Utc>>,
    stalled: bool,
    last_handled_at: Option<DateTime<Utc>>,
}

pub struct HeartbeatMonitor {
    store: Arc<dyn HeartbeatStore>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn StallHandler>,
    state: Mutex<MonitorState>,
    status_tx: watch::Sender<HeartbeatStatus>,
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<dyn HeartbeatStore>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn StallHandler>,
    ) -> Self {
        let (status_tx, _) = watch::channel(HeartbeatStatus::Missing);
        Self {
            store,
            config,
            clock,
            handler,
            state: Mutex::new(MonitorState::default()),
            status_tx,
        }
    }

    /// Classify the current heartbeat without side effects.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<HeartbeatStatus> {
        let heartbeat = self.config.snapshot().heartbeat.clone();
        let status = match self.store.last_beat(&heartbeat.source_id).await? {
            None => HeartbeatStatus::Missing,
            Some(record) => {
                let age = elapsed_between(record.last_beat_at, now);
                if age > heartbeat.ttl() {
                    HeartbeatStatus::Stalled { age }
                } else {
                    HeartbeatStatus::Healthy { age }
                }
            }
        };
        Ok(status)
    }

    /// Last status observed by `tick`.
    pub fn status(&self) -> HeartbeatStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<HeartbeatStatus> {
        self.status_tx.subscribe()
    }

    /// One monitoring step: check, publish, and react to a stall.
    pub async fn tick(&self) -> Result<HeartbeatStatus> {
        let now = self.clock.now();
        let heartbeat = self.config.snapshot().heartbeat.clone();
        let status = self.check(now).await?;

        if let Some(age) = status.age() {
            metrics::gauge!("sr_heartbeat_age_seconds").set(age.as_secs_f64());
        }
        self.status_tx.send_replace(status);

        let should_handle = {
            let mut state = self.state.lock();
            let started_at = *state.started_at.get_or_insert(now);
            // A fresh monitor gives the scheduler one TTL to write its first beat
            let in_grace = elapsed_between(started_at, now) <= heartbeat.ttl();
            let stalled = match status {
                HeartbeatStatus::Healthy { .. } => false,
                HeartbeatStatus::Stalled { .. } => true,
                HeartbeatStatus::Missing => !in_grace,
            };

            if !stalled {
                if state.stalled {
                    info!(source_id = %heartbeat.source_id, "Heartbeat recovered");
                }
                state.stalled = false;
                state.last_handled_at = None;
                false
            } else {
                let cooled_down = state
                    .last_handled_at
                    .map(|at| elapsed_between(at, now) >= heartbeat.restart_cooldown())
                    .unwrap_or(true);
                let entering = !state.stalled;
                state.stalled = true;
                if entering || cooled_down {
                    state.last_handled_at = Some(now);
                    true
                } else {
                    false
                }
            }
        };

        metrics::gauge!("sr_heartbeat_stalled").set(if self.is_stalled() { 1.0 } else { 0.0 });

        if should_handle {
            warn!(
                source_id = %heartbeat.source_id,
                status = status.as_str(),
                age = ?status.age(),
                ttl = ?heartbeat.ttl(),
                "Heartbeat stale"
            );
            if let Err(e) = self.handler.on_stall(&heartbeat.source_id, status).await {
                error!(error = %e, "Stall handler failed");
            }
        }

        Ok(status)
    }

    /// Whether the monitor currently considers the scheduler stalled.
    pub fn is_stalled(&self) -> bool {
        self.state.lock().stalled
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let check_every = self.config.snapshot().heartbeat.check_interval();
        info!(interval = ?check_every, "Starting heartbeat monitor");

        let mut ticker = interval(check_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Heartbeat check failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Heartbeat monitor shutting down");
                    break;
                }
            }
        }
    }
}
