//! SQLite store behaviour against an in-memory database.

#![cfg(feature = "sqlite")]

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sr_common::{EntryStatus, ErrorKind, LastError, NewEntry};
use sr_outbox::{OutboxError, OutboxStore, SqliteOutboxStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

async fn store() -> SqliteOutboxStore {
    // One connection: every connection to `sqlite::memory:` is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteOutboxStore::new(pool);
    store.init_schema().await.unwrap();
    store
}

fn card(key: &str) -> NewEntry {
    NewEntry::new("1", key, json!({"text": format!("card {key}")}))
}

#[tokio::test]
async fn test_enqueue_idempotent_until_dlq() {
    let store = store().await;
    let now = Utc::now();

    let first = store.enqueue(card("evt:A"), now).await.unwrap();
    let again = store.enqueue(card("evt:A"), now).await.unwrap();
    assert!(first.inserted);
    assert_eq!(again, sr_common::EnqueueResult { id: first.id.clone(), inserted: false });

    let claim = store.claim_batch(1, now).await.unwrap().remove(0);
    let err = LastError::new(ErrorKind::Permanent, "HTTP 400").with_code(Some(400));
    store.send_to_dlq(&first.id, claim.token(), &err, now).await.unwrap();

    // The DLQ entry no longer holds the key
    let fresh = store.enqueue(card("evt:A"), now).await.unwrap();
    assert!(fresh.inserted);
    assert_ne!(fresh.id, first.id);

    let dlq = store.list_dlq(10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].last_error.as_ref().unwrap().code, Some(400));

    let conflict = store.requeue_from_dlq(&first.id, now).await;
    assert!(matches!(conflict, Err(OutboxError::Conflict(_))));
}

#[tokio::test]
async fn test_claims_are_disjoint_under_concurrency() {
    let store = Arc::new(store().await);
    let now = Utc::now();
    for i in 0..50 {
        store.enqueue(card(&format!("evt:{i}")), now).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                let batch = store.claim_batch(3, now).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                ids.extend(batch.into_iter().map(|e| e.id));
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "entry claimed twice");
        }
    }
    assert_eq!(seen.len(), 50);
}

#[tokio::test]
async fn test_transitions_and_counters() {
    let store = store().await;
    let now = Utc::now();
    let id = store.enqueue(card("evt:A"), now).await.unwrap().id;
    let transient = LastError::new(ErrorKind::Transient, "HTTP 502").with_code(Some(502));

    let claim = store.claim_batch(5, now).await.unwrap().remove(0);
    assert_eq!(claim.status, EntryStatus::Sending);
    let retry_at = now + ChronoDuration::seconds(2);
    store.fail(&id, claim.token(), &transient, retry_at, now).await.unwrap();

    // Not yet eligible
    assert!(store.claim_batch(5, now).await.unwrap().is_empty());

    let claim = store.claim_batch(5, retry_at).await.unwrap().remove(0);
    assert!(store.complete(&id, claim.token(), retry_at).await.unwrap());
    assert!(!store.complete(&id, claim.token(), retry_at).await.unwrap());

    let entry = store.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Done);
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.attempts, 2);
    assert_eq!(entry.last_error.unwrap().kind, ErrorKind::Transient);
    assert!(entry.claim_token.is_none());

    let counts = store.count_by_status().await.unwrap();
    assert_eq!(counts.done, 1);
    assert_eq!(counts.total(), 1);
}

#[tokio::test]
async fn test_stale_claim_recovery_revokes_old_token() {
    let store = store().await;
    let t0 = Utc::now();
    let id = store.enqueue(card("evt:A"), t0).await.unwrap().id;

    let orphan = store.claim_batch(1, t0).await.unwrap().remove(0);
    let later = t0 + ChronoDuration::seconds(301);
    let recovered = store
        .recover_stale_claims(Duration::from_secs(300), later)
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let pending = store.list_by_status(EntryStatus::Pending, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 0);

    let result = store.release(&id, orphan.token(), later, later).await;
    assert!(matches!(result, Err(OutboxError::ClaimLost(_))));

    let missing = store.complete("nope", orphan.token(), later).await;
    assert!(matches!(missing, Err(OutboxError::NotFound(_))));
}

#[tokio::test]
async fn test_renewed_claim_survives_recovery() {
    let store = store().await;
    let t0 = Utc::now();
    let id = store.enqueue(card("evt:A"), t0).await.unwrap().id;
    let claim = store.claim_batch(1, t0).await.unwrap().remove(0);

    store
        .renew_claim(&id, claim.token(), t0 + ChronoDuration::seconds(200))
        .await
        .unwrap();

    let later = t0 + ChronoDuration::seconds(400);
    let recovered = store
        .recover_stale_claims(Duration::from_secs(300), later)
        .await
        .unwrap();
    assert_eq!(recovered, 0);

    let renewed = store.get(&id).await.unwrap().unwrap();
    assert_eq!(renewed.status, EntryStatus::Sending);
    assert_eq!(
        renewed.claimed_at.map(|at| at.timestamp_millis()),
        Some((t0 + ChronoDuration::seconds(200)).timestamp_millis())
    );

    let foreign = store.renew_claim(&id, "not-my-token", later).await;
    assert!(matches!(foreign, Err(OutboxError::ClaimLost(_))));
    assert!(store.complete(&id, claim.token(), later).await.unwrap());
}

#[tokio::test]
async fn test_requeue_restores_eligibility() {
    let store = store().await;
    let now = Utc::now();
    let id = store.enqueue(card("evt:A"), now).await.unwrap().id;
    let claim = store.claim_batch(1, now).await.unwrap().remove(0);
    let exhausted = LastError::new(ErrorKind::Exhausted, "retries exhausted");
    store.send_to_dlq(&id, claim.token(), &exhausted, now).await.unwrap();

    let later = now + ChronoDuration::minutes(20);
    let requeued = store.requeue_from_dlq(&id, later).await.unwrap();
    assert_eq!(requeued.status, EntryStatus::Pending);
    assert_eq!(requeued.next_retry_at.timestamp_millis(), later.timestamp_millis());

    let again = store.requeue_from_dlq(&id, later).await;
    assert!(matches!(again, Err(OutboxError::InvalidState { .. })));

    assert_eq!(store.claim_batch(1, later).await.unwrap().len(), 1);
}
