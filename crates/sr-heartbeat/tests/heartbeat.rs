//! Heartbeat writer and monitor driven by a manual clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sr_common::{Clock, LivenessSource, ManualClock};
use sr_config::{ConfigHandle, RelayConfig};
use sr_heartbeat::{
    HeartbeatMonitor, HeartbeatStatus, HeartbeatWriter, MemoryHeartbeatStore, Result, StallHandler,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<HeartbeatStatus>>,
}

#[async_trait]
impl StallHandler for RecordingHandler {
    async fn on_stall(&self, _source_id: &str, status: HeartbeatStatus) -> Result<()> {
        self.calls.lock().push(status);
        Ok(())
    }
}

struct Progress(Mutex<Option<DateTime<Utc>>>);

impl LivenessSource for Progress {
    fn last_progress(&self) -> Option<DateTime<Utc>> {
        *self.0.lock()
    }
}

struct Fixture {
    clock: Arc<ManualClock>,
    writer: HeartbeatWriter,
    monitor: HeartbeatMonitor,
    handler: Arc<RecordingHandler>,
}

fn fixture() -> Fixture {
    let mut config = RelayConfig::default();
    config.heartbeat.interval_secs = 10;
    config.heartbeat.ttl_secs = 30;
    config.heartbeat.check_interval_secs = 10;
    config.heartbeat.restart_cooldown_secs = 120;
    let config = ConfigHandle::new(config).unwrap();

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(MemoryHeartbeatStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let writer = HeartbeatWriter::new(store.clone(), config.clone(), clock.clone());
    let monitor = HeartbeatMonitor::new(store, config, clock.clone(), handler.clone());

    Fixture {
        clock,
        writer,
        monitor,
        handler,
    }
}

#[tokio::test]
async fn test_healthy_while_beating() {
    let f = fixture();
    for _ in 0..5 {
        assert!(f.writer.beat_once().await.unwrap());
        f.clock.advance(Duration::from_secs(10));
        assert!(f.monitor.tick().await.unwrap().is_healthy());
    }
    assert!(f.handler.calls.lock().is_empty());
}

#[tokio::test]
async fn test_stall_reported_within_one_check_interval() {
    let f = fixture();
    f.writer.beat_once().await.unwrap();
    f.monitor.tick().await.unwrap();

    // Writer dies. Check every 10s; TTL is 30s.
    let mut detected_at = None;
    for step in 1..=5u64 {
        f.clock.advance(Duration::from_secs(10));
        if !f.monitor.tick().await.unwrap().is_healthy() {
            detected_at = Some(step * 10);
            break;
        }
    }

    // age 30 is not > ttl; age 40 is the first check past it
    assert_eq!(detected_at, Some(40));
    assert!(f.monitor.is_stalled());
    assert_eq!(f.handler.calls.lock().len(), 1);
}

#[tokio::test]
async fn test_handler_repeats_only_after_cooldown() {
    let f = fixture();
    f.writer.beat_once().await.unwrap();
    f.clock.advance(Duration::from_secs(31));
    f.monitor.tick().await.unwrap();
    assert_eq!(f.handler.calls.lock().len(), 1);

    for _ in 0..11 {
        f.clock.advance(Duration::from_secs(10));
        f.monitor.tick().await.unwrap();
    }
    assert_eq!(f.handler.calls.lock().len(), 1);

    f.clock.advance(Duration::from_secs(10));
    f.monitor.tick().await.unwrap();
    assert_eq!(f.handler.calls.lock().len(), 2);

    // Recovery resets the stall
    f.writer.beat_once().await.unwrap();
    assert!(f.monitor.tick().await.unwrap().is_healthy());
    assert!(!f.monitor.is_stalled());
}

#[tokio::test]
async fn test_missing_heartbeat_has_startup_grace() {
    let f = fixture();
    assert_eq!(f.monitor.tick().await.unwrap(), HeartbeatStatus::Missing);
    assert!(!f.monitor.is_stalled());

    f.clock.advance(Duration::from_secs(31));
    assert_eq!(f.monitor.tick().await.unwrap(), HeartbeatStatus::Missing);
    assert!(f.monitor.is_stalled());
    assert_eq!(f.handler.calls.lock().len(), 1);
}

#[tokio::test]
async fn test_wedged_liveness_source_withholds_beats() {
    let f = fixture();
    let progress = Arc::new(Progress(Mutex::new(Some(f.clock.now()))));
    let writer = f.writer.with_liveness(progress.clone());

    assert!(writer.beat_once().await.unwrap());

    // Timer task alive, scheduling loop stuck
    f.clock.advance(Duration::from_secs(31));
    assert!(!writer.beat_once().await.unwrap());
    assert!(matches!(
        f.monitor.tick().await.unwrap(),
        HeartbeatStatus::Stalled { .. }
    ));

    *progress.0.lock() = Some(f.clock.now());
    assert!(writer.beat_once().await.unwrap());
    assert!(f.monitor.tick().await.unwrap().is_healthy());
}
