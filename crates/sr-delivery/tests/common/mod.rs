#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sr_common::{Clock, ManualClock, OutboxEntry, SendOutcome};
use sr_config::{ChannelConfig, ConfigHandle, RelayConfig};
use sr_delivery::{ChannelClient, Dispatcher, RateLimiter};
use sr_outbox::{MemoryOutboxStore, OutboxStore};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Channel client that replays scripted outcomes per event key and
/// succeeds once a key's script runs out.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<SendOutcome>>>,
    calls: Mutex<Vec<String>>,
    in_flight: Mutex<HashSet<String>>,
    overlaps: Mutex<usize>,
    delay: Duration,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn script(&self, event_key: &str, outcomes: Vec<SendOutcome>) {
        self.scripts
            .lock()
            .insert(event_key.to_string(), outcomes.into_iter().collect());
    }

    /// Event keys in the order they were sent.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Times a send started while another send of the same entry was running.
    pub fn overlaps(&self) -> usize {
        *self.overlaps.lock()
    }
}

#[async_trait]
impl ChannelClient for ScriptedClient {
    async fn send(&self, entry: &OutboxEntry) -> SendOutcome {
        self.calls.lock().push(entry.event_key.clone());
        if !self.in_flight.lock().insert(entry.id.clone()) {
            *self.overlaps.lock() += 1;
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.lock().remove(&entry.id);
        self.scripts
            .lock()
            .get_mut(&entry.event_key)
            .and_then(|script| script.pop_front())
            .unwrap_or(SendOutcome::Ok)
    }
}

pub fn config_with_channels(channels: &[&str]) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.rate_limit.max_per_window = 1_000;
    config.rate_limit.global_max_per_window = 1_000;
    config.rate_limit.window_ms = 1_000;
    config.delivery.poll_interval_ms = 10;
    config.channels = channels
        .iter()
        .map(|id| ChannelConfig::new(*id, format!("http://localhost/{id}")))
        .collect();
    config
}

pub struct Harness {
    pub store: Arc<MemoryOutboxStore>,
    pub client: Arc<ScriptedClient>,
    pub clock: Arc<ManualClock>,
    pub config: ConfigHandle,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(config: RelayConfig, client: ScriptedClient) -> Self {
        sr_common::logging::init_test_logging();
        let store = Arc::new(MemoryOutboxStore::new());
        let client = Arc::new(client);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = ConfigHandle::new(config).unwrap();
        let limiter = Arc::new(RateLimiter::new(config.clone()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            client.clone(),
            limiter,
            config.clone(),
            clock.clone(),
        );
        Self {
            store,
            client,
            clock,
            config,
            dispatcher,
        }
    }

    pub async fn enqueue(&self, channel: &str, key: &str) -> String {
        self.store
            .enqueue(
                sr_common::NewEntry::new(channel, key, serde_json::json!({"text": key})),
                self.clock.now(),
            )
            .await
            .unwrap()
            .id
    }

    pub async fn entry(&self, id: &str) -> OutboxEntry {
        self.store.get(id).await.unwrap().unwrap()
    }

    /// Time until the entry becomes eligible again.
    pub async fn wait_of(&self, id: &str) -> Duration {
        let entry = self.entry(id).await;
        sr_common::elapsed_between(self.clock.now(), entry.next_retry_at)
    }
}
