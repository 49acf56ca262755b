//! Worker pool behaviour: exclusive ownership and graceful shutdown.

mod common;

use common::{config_with_channels, Harness, ScriptedClient};
use sr_common::EntryStatus;
use sr_delivery::DeliveryError;
use sr_outbox::OutboxStore;
use std::time::Duration;

async fn wait_until_done(h: &Harness, expected: u64) {
    for _ in 0..500 {
        if h.store.count_by_status().await.unwrap().done == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("entries were not delivered in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_entry_is_sent_exactly_once_by_the_pool() {
    let mut config = config_with_channels(&["1", "2"]);
    config.delivery.workers = 4;
    config.delivery.batch_size = 3;
    let h = Harness::new(config, ScriptedClient::with_delay(Duration::from_millis(2)));

    for i in 0..40 {
        let channel = if i % 2 == 0 { "1" } else { "2" };
        h.enqueue(channel, &format!("evt:{i}")).await;
    }

    h.dispatcher.start().unwrap();
    wait_until_done(&h, 40).await;
    h.dispatcher.shutdown().await.unwrap();

    let mut calls = h.client.calls();
    assert_eq!(calls.len(), 40);
    calls.sort();
    calls.dedup();
    assert_eq!(calls.len(), 40);
    assert_eq!(h.client.overlaps(), 0);
    assert_eq!(h.dispatcher.stats().claimed, 40);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let h = Harness::new(config_with_channels(&["1"]), ScriptedClient::new());
    h.dispatcher.start().unwrap();
    assert!(matches!(h.dispatcher.start(), Err(DeliveryError::AlreadyStarted)));
    h.dispatcher.shutdown().await.unwrap();
    assert!(!h.dispatcher.is_running());
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_send_and_releases_the_rest() {
    let mut config = config_with_channels(&["1"]);
    config.delivery.workers = 1;
    let h = Harness::new(config, ScriptedClient::with_delay(Duration::from_millis(200)));

    let first = h.enqueue("1", "evt:A").await;
    h.enqueue("1", "evt:B").await;
    h.enqueue("1", "evt:C").await;

    h.dispatcher.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.dispatcher.shutdown().await.unwrap();

    assert_eq!(h.entry(&first).await.status, EntryStatus::Done);
    let counts = h.store.count_by_status().await.unwrap();
    assert_eq!(counts.done, 1);
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.sending, 0);
    assert_eq!(h.client.calls(), vec!["evt:A"]);
    assert_eq!(h.dispatcher.stats().released, 2);
}
