//! Concurrency behaviour of the in-memory store.

use chrono::Utc;
use serde_json::json;
use sr_common::NewEntry;
use sr_outbox::{MemoryOutboxStore, OutboxStore};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimers_never_share_an_entry() {
    let store = Arc::new(MemoryOutboxStore::new());
    let now = Utc::now();
    for i in 0..200 {
        store
            .enqueue(NewEntry::new("1", format!("evt:{i}"), json!({"n": i})), now)
            .await
            .unwrap();
    }

    let claimers = (0..16).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                let batch = store.claim_batch(7, now).await.unwrap();
                if batch.is_empty() {
                    return ids;
                }
                ids.extend(batch.into_iter().map(|e| e.id));
            }
        })
    });

    let results = futures::future::join_all(claimers).await;
    let mut seen = HashSet::new();
    for ids in results {
        for id in ids.unwrap() {
            assert!(seen.insert(id));
        }
    }
    assert_eq!(seen.len(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_enqueues_collapse() {
    let store = Arc::new(MemoryOutboxStore::new());
    let now = Utc::now();

    let producers = (0..10).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .enqueue(NewEntry::new("1", "evt:same", json!("x")), now)
                .await
                .unwrap()
        })
    });

    let results: Vec<_> = futures::future::join_all(producers)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.inserted).count(), 1);
    let ids: HashSet<_> = results.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.len(), 1);
}
