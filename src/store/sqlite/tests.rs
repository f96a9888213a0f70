//! SQLite store tests.

use std::sync::Arc;

use serde_json::json;
use tempfile::NamedTempFile;

use super::*;
use crate::job::JobState;
use crate::retry::RetryPolicy;
use crate::store::StaleOutcome;

/// Helper to create a test store on a temp file.
fn create_test_store() -> (Arc<SqliteStore>, NamedTempFile) {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let config = SqliteConfig {
        path: temp_file.path().to_path_buf(),
        wal_mode: true,
        synchronous: 0, // OFF for test speed
        cache_size: -2000,
    };
    let store = SqliteStore::open(config).expect("Failed to open store");
    (Arc::new(store), temp_file)
}

fn test_job(queue: &str, priority: i32, created_at: u64) -> Job {
    let mut job = Job::new(
        queue,
        "default",
        json!({"k": "v"}),
        priority,
        RetryPolicy::exponential(3, 1000),
        0,
        created_at,
    );
    job.process_at = created_at;
    job
}

#[tokio::test]
async fn save_then_find_round_trips_all_fields() {
    let (store, _temp) = create_test_store();
    let mut job = test_job("mail", 7, 1_000);
    job.progress = 33;
    job.failed_reason = Some("earlier attempt".to_string());
    job.stacktrace = Some("at send()".to_string());
    job.return_value = Some(json!({"sent": 1}));
    job.remove_on_complete = true;
    job.locked_by = Some("w1".to_string());
    job.lock_expires_at = Some(99_000);
    job.attempts_made = 2;

    store.save(&job).await.unwrap();
    let loaded = store.find_by_id(&job.id).await.unwrap().unwrap();

    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.queue, job.queue);
    assert_eq!(loaded.name, job.name);
    assert_eq!(*loaded.payload, *job.payload);
    assert_eq!(loaded.state, job.state);
    assert_eq!(loaded.priority, 7);
    assert_eq!(loaded.attempts_made, 2);
    assert_eq!(loaded.retry, job.retry);
    assert_eq!(loaded.created_at, job.created_at);
    assert_eq!(loaded.updated_at, job.updated_at);
    assert_eq!(loaded.process_at, job.process_at);
    assert_eq!(loaded.locked_by, job.locked_by);
    assert_eq!(loaded.lock_expires_at, job.lock_expires_at);
    assert_eq!(loaded.progress, 33);
    assert_eq!(loaded.return_value, job.return_value);
    assert_eq!(loaded.failed_reason, job.failed_reason);
    assert_eq!(loaded.stacktrace, job.stacktrace);
    assert!(loaded.remove_on_complete);
    assert!(!loaded.remove_on_fail);
}

#[tokio::test]
async fn find_missing_job_is_none() {
    let (store, _temp) = create_test_store();
    assert!(store.find_by_id(&JobId::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn save_is_an_upsert() {
    let (store, _temp) = create_test_store();
    let mut job = test_job("q", 0, 1_000);
    store.save(&job).await.unwrap();

    job.move_to_active("w1", 31_000, 1_100).unwrap();
    store.save(&job).await.unwrap();

    let loaded = store.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.state, JobState::Active);
    assert_eq!(loaded.attempts_made, 1);
}

#[tokio::test]
async fn claim_orders_by_priority_desc_then_created_asc() {
    let (store, _temp) = create_test_store();
    let low = test_job("q", 1, 300);
    let high_new = test_job("q", 5, 200);
    let high_old = test_job("q", 5, 100);
    for j in [&low, &high_new, &high_old] {
        store.save(j).await.unwrap();
    }

    let a = store.claim_next("q", "w1", 30_000, 1_000).await.unwrap();
    let b = store.claim_next("q", "w1", 30_000, 1_000).await.unwrap();
    let c = store.claim_next("q", "w1", 30_000, 1_000).await.unwrap();
    let d = store.claim_next("q", "w1", 30_000, 1_000).await.unwrap();
    assert_eq!(a.unwrap().id, high_old.id);
    assert_eq!(b.unwrap().id, high_new.id);
    assert_eq!(c.unwrap().id, low.id);
    assert!(d.is_none());
}

#[tokio::test]
async fn claim_marks_active_and_sets_lease() {
    let (store, _temp) = create_test_store();
    let job = test_job("q", 0, 1_000);
    store.save(&job).await.unwrap();

    let claimed = store
        .claim_next("q", "w1", 30_000, 2_000)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.attempts_made, 1);
    assert_eq!(claimed.locked_by.as_deref(), Some("w1"));
    assert_eq!(claimed.lock_expires_at, Some(32_000));
    assert_eq!(claimed.updated_at, 2_000);
}

#[tokio::test]
async fn delayed_job_ineligible_before_process_at() {
    let (store, _temp) = create_test_store();
    let mut job = test_job("q", 0, 1_000);
    job.state = JobState::Delayed;
    job.process_at = 5_000;
    store.save(&job).await.unwrap();

    assert!(store
        .claim_next("q", "w1", 30_000, 4_999)
        .await
        .unwrap()
        .is_none());
    let claimed = store.claim_next("q", "w1", 30_000, 5_000).await.unwrap();
    assert_eq!(claimed.unwrap().id, job.id);
}

#[tokio::test]
async fn claim_skips_other_queues_and_exhausted_jobs() {
    let (store, _temp) = create_test_store();
    let other = test_job("other", 0, 1_000);
    let mut spent = test_job("q", 0, 1_000);
    spent.attempts_made = 3;
    store.save(&other).await.unwrap();
    store.save(&spent).await.unwrap();

    assert!(store
        .claim_next("q", "w1", 30_000, 2_000)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_the_same_job() {
    let (store, _temp) = create_test_store();
    for i in 0..10 {
        store.save(&test_job("q", 0, 1_000 + i)).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..10 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .claim_next("q", &format!("w{w}"), 30_000, 2_000)
                .await
                .unwrap()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    for h in handles {
        let job = h.await.unwrap().expect("one job per claimer");
        assert!(seen.insert(job.id), "job handed out twice");
    }
    assert_eq!(seen.len(), 10);
}

#[tokio::test]
async fn two_workers_race_for_one_job() {
    let (store, _temp) = create_test_store();
    store.save(&test_job("q", 0, 1_000)).await.unwrap();

    let s1 = Arc::clone(&store);
    let s2 = Arc::clone(&store);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { s1.claim_next("q", "w1", 30_000, 2_000).await.unwrap() }),
        tokio::spawn(async move { s2.claim_next("q", "w2", 30_000, 2_000).await.unwrap() }),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_some() ^ b.is_some(), "exactly one claim must win");
}

#[tokio::test]
async fn cancel_refuses_active_jobs() {
    let (store, _temp) = create_test_store();
    let waiting = test_job("q", 0, 1_000);
    let active = test_job("q", 0, 999);
    store.save(&waiting).await.unwrap();
    store.save(&active).await.unwrap();
    let claimed = store
        .claim_next("q", "w1", 30_000, 2_000)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, active.id);

    assert!(!store.cancel(&active.id).await.unwrap());
    assert!(store.cancel(&waiting.id).await.unwrap());
    assert!(store.find_by_id(&waiting.id).await.unwrap().is_none());
}

#[tokio::test]
async fn find_stale_returns_only_expired_leases() {
    let (store, _temp) = create_test_store();
    let fresh = test_job("q", 0, 500);
    let stale = test_job("q", 9, 400);
    store.save(&fresh).await.unwrap();
    store.save(&stale).await.unwrap();

    // stale has higher priority so it is claimed first, with a short lease.
    store.claim_next("q", "w1", 1_000, 1_000).await.unwrap();
    store.claim_next("q", "w2", 60_000, 1_000).await.unwrap();

    let found = store.find_stale("q", 3_000).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, stale.id);
}

#[tokio::test]
async fn recover_stale_retry_requeues_once() {
    let (store, _temp) = create_test_store();
    let job = test_job("q", 0, 500);
    store.save(&job).await.unwrap();
    store.claim_next("q", "w1", 1_000, 1_000).await.unwrap();

    let outcome = StaleOutcome::Retry {
        process_at: 9_000,
        reason: "lock expired; worker presumed dead".to_string(),
    };
    assert!(store.recover_stale(&job.id, &outcome, 3_000).await.unwrap());
    assert!(!store.recover_stale(&job.id, &outcome, 3_000).await.unwrap());

    let recovered = store.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(recovered.state, JobState::Delayed);
    assert_eq!(recovered.process_at, 9_000);
    assert!(recovered.locked_by.is_none());
    assert!(recovered.lock_expires_at.is_none());
}

#[tokio::test]
async fn recover_stale_fail_marks_failed() {
    let (store, _temp) = create_test_store();
    let job = test_job("q", 0, 500);
    store.save(&job).await.unwrap();
    store.claim_next("q", "w1", 1_000, 1_000).await.unwrap();

    let outcome = StaleOutcome::Fail {
        reason: "lock expired after final attempt".to_string(),
    };
    assert!(store.recover_stale(&job.id, &outcome, 3_000).await.unwrap());
    let failed = store.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(
        failed.failed_reason.as_deref(),
        Some("lock expired after final attempt")
    );
}

#[tokio::test]
async fn progress_update_guarded_against_terminal_states() {
    let (store, _temp) = create_test_store();
    let mut job = test_job("q", 0, 500);
    store.save(&job).await.unwrap();

    assert!(store.update_progress(&job.id, 40, 1_000).await.unwrap());
    assert_eq!(
        store
            .find_by_id(&job.id)
            .await
            .unwrap()
            .unwrap()
            .progress,
        40
    );

    job.move_to_active("w1", 31_000, 1_100).unwrap();
    job.move_to_completed(json!(true), 1_200).unwrap();
    store.save(&job).await.unwrap();
    assert!(!store.update_progress(&job.id, 80, 1_300).await.unwrap());
}

#[tokio::test]
async fn counts_tally_per_state() {
    let (store, _temp) = create_test_store();
    let mut delayed = test_job("q", 0, 500);
    delayed.state = JobState::Delayed;
    delayed.process_at = 99_000;
    let mut failed = test_job("q", 0, 500);
    failed.state = JobState::Failed;
    for j in [
        &test_job("q", 0, 500),
        &test_job("q", 0, 501),
        &delayed,
        &failed,
        &test_job("elsewhere", 0, 500),
    ] {
        store.save(j).await.unwrap();
    }
    store.claim_next("q", "w1", 30_000, 1_000).await.unwrap();

    let counts = store.counts("q").await.unwrap();
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.active, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.completed, 0);
}
