//! Heartbeat writer.
//!
//! Beats every `heartbeat.interval`. When attached to a [`LivenessSource`]
//! the beat is only written while that source reports progress within the
//! TTL; a wedged dispatcher therefore goes quiet and its monitor notices.

use sr_common::{elapsed_between, Clock, LivenessSource};
use sr_config::ConfigHandle;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::store::{HeartbeatRecord, HeartbeatStore};

pub struct HeartbeatWriter {
    store: Arc<dyn HeartbeatStore>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    liveness: Option<Arc<dyn LivenessSource>>,
}

impl HeartbeatWriter {
    pub fn new(store: Arc<dyn HeartbeatStore>, config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            liveness: None,
        }
    }

    /// Only beat while `source` keeps making progress.
    pub fn with_liveness(mut self, source: Arc<dyn LivenessSource>) -> Self {
        self.liveness = Some(source);
        self
    }

    /// Write one beat. Returns `false` when the liveness gate withheld it.
    pub async fn beat_once(&self) -> Result<bool> {
        let heartbeat = self.config.snapshot().heartbeat.clone();
        let now = self.clock.now();

        if let Some(source) = &self.liveness {
            let progressing = source
                .last_progress()
                .is_some_and(|at| elapsed_between(at, now) <= heartbeat.ttl());
            if !progressing {
                warn!(
                    source_id = %heartbeat.source_id,
                    last_progress = ?source.last_progress(),
                    "Scheduling loop made no recent progress; withholding heartbeat"
                );
                return Ok(false);
            }
        }

        let record = HeartbeatRecord::new(heartbeat.source_id.clone(), now);
        self.store.beat(&record, heartbeat.ttl()).await?;
        Ok(true)
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let heartbeat = self.config.snapshot().heartbeat.clone();
        info!(
            source_id = %heartbeat.source_id,
            interval = ?heartbeat.interval(),
            ttl = ?heartbeat.ttl(),
            "Starting heartbeat writer"
        );

        let mut ticker = interval(heartbeat.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.beat_once().await {
                        error!(error = %e, "Failed to write heartbeat");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Heartbeat writer shutting down");
                    break;
                }
            }
        }
    }
}
