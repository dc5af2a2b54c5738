//! Failure handling tests for sync cycles
//!
//! A failed cycle must leave the watermark where it was, so the next
//! successful cycle pushes and pulls everything the failed one missed.

use lectern_core::{EntityKind, SyncSettings};
use lectern_store::MemoryRemoteStore;
use lectern_sync::{CycleOutcome, SyncState};
use lectern_test_utils::{lecture, manual_time, note, Device, Fault, FlakyRemote, USER};
use std::sync::Arc;

#[tokio::test]
async fn test_failed_push_keeps_watermark_and_retry_pushes_again() {
    let time = manual_time(1_000);
    let remote = Arc::new(MemoryRemoteStore::new().with_time_source(time.clone()));
    let flaky = Arc::new(FlakyRemote::new(remote.clone()));
    let dev = Device::in_memory("A", flaky.clone(), time.clone(), SyncSettings::default());

    dev.notes().create(note("lec", "one", 0)).await.unwrap();
    dev.notes().create(note("lec", "two", 1_000)).await.unwrap();

    flaky.fail_upserts(1, Fault::Unavailable);
    time.set(2_000);
    let report = dev.sync().await;

    assert!(matches!(report.outcome, CycleOutcome::Retry(_)));
    assert_eq!(report.watermark_after, None);
    assert_eq!(dev.watermark().await, 0);
    assert!(matches!(dev.engine.state(), SyncState::Failed(_)));
    assert_eq!(remote.document_count(USER, EntityKind::Note), 0);
    // Pull still ran for every kind.
    assert_eq!(flaky.fetch_calls(), 3);

    time.set(3_000);
    let report = dev.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.pushed(), 2);
    assert_eq!(dev.watermark().await, 3_000);
    assert_eq!(dev.engine.state(), SyncState::Idle);
    assert_eq!(remote.document_count(USER, EntityKind::Note), 2);

    let stats = dev.engine.stats();
    assert_eq!(stats.failed_cycles, 1);
    assert_eq!(stats.successful_cycles, 1);
    assert_eq!(stats.last_sync_time, Some(3_000));
}

#[tokio::test]
async fn test_failed_pull_is_repeated_from_the_old_watermark() {
    let time = manual_time(1_000);
    let remote = Arc::new(MemoryRemoteStore::new().with_time_source(time.clone()));
    let a = Device::in_memory("A", remote.clone(), time.clone(), SyncSettings::default());
    let flaky = Arc::new(FlakyRemote::new(remote.clone()));
    let b = Device::in_memory("B", flaky.clone(), time.clone(), SyncSettings::default());

    let lec = a.lectures().create(lecture("net-03")).await.unwrap();
    a.notes().create(note(&lec.id, "tcp", 0)).await.unwrap();
    time.set(2_000);
    a.sync().await;

    // Lectures are pulled first; that fetch fails, notes still merge.
    flaky.fail_fetches(1, Fault::Unavailable);
    time.set(3_000);
    let report = b.sync().await;
    assert!(matches!(report.outcome, CycleOutcome::Retry(_)));
    assert_eq!(b.watermark().await, 0);
    assert!(b.lectures().get(&lec.id).await.unwrap().is_none());
    assert_eq!(b.notes().list().await.unwrap().len(), 1);

    time.set(4_000);
    let report = b.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.merged().inserted, 1);
    assert_eq!(report.merged().kept_local, 1);
    assert!(b.lectures().get(&lec.id).await.unwrap().is_some());
    assert_eq!(b.watermark().await, 4_000);
}

#[tokio::test]
async fn test_partial_push_is_idempotent_on_retry() {
    let time = manual_time(1_000);
    let remote = Arc::new(MemoryRemoteStore::new().with_time_source(time.clone()));
    let flaky = Arc::new(FlakyRemote::new(remote.clone()));
    let settings = SyncSettings::default().with_batch_size(2);
    let dev = Device::in_memory("A", flaky.clone(), time.clone(), settings);

    for i in 0..5 {
        dev.notes().create(note("lec", &format!("n{i}"), i)).await.unwrap();
    }

    // First batch lands, the second one fails and aborts the kind.
    flaky.fail_upsert_after(1, 1, Fault::Unavailable);
    time.set(2_000);
    let report = dev.sync().await;
    assert!(matches!(report.outcome, CycleOutcome::Retry(_)));
    let notes = report.kinds.iter().find(|k| k.kind == EntityKind::Note).unwrap();
    assert_eq!(notes.pushed, 2);
    assert_eq!(notes.errors.len(), 1);
    assert_eq!(remote.document_count(USER, EntityKind::Note), 2);
    assert_eq!(flaky.upsert_calls(), 2);

    // The retry pushes everything again; the already-written batch is
    // merged onto itself.
    time.set(3_000);
    let report = dev.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.pushed(), 5);
    assert_eq!(remote.document_count(USER, EntityKind::Note), 5);
    assert_eq!(remote.batch_sizes(), vec![2, 2, 2, 1]);
}

#[tokio::test]
async fn test_unauthorized_remote_clears_token() {
    let time = manual_time(1_000);
    let remote = Arc::new(MemoryRemoteStore::new().with_time_source(time.clone()));
    let flaky = Arc::new(FlakyRemote::new(remote.clone()));
    let dev = Device::in_memory("A", flaky.clone(), time.clone(), SyncSettings::default());
    dev.notes().create(note("lec", "x", 0)).await.unwrap();

    flaky.fail_upserts(1, Fault::Unauthorized);
    time.set(2_000);
    let report = dev.sync().await;

    assert!(matches!(report.outcome, CycleOutcome::Retry(_)));
    assert_eq!(dev.auth.clear_count(), 1);
    assert_eq!(dev.watermark().await, 0);

    time.set(3_000);
    assert_eq!(dev.sync().await.outcome, CycleOutcome::Completed);
    assert_eq!(dev.auth.clear_count(), 1);
}

#[tokio::test]
async fn test_rejected_batch_is_a_permanent_failure() {
    let time = manual_time(1_000);
    let remote = Arc::new(MemoryRemoteStore::new().with_time_source(time.clone()));
    let flaky = Arc::new(FlakyRemote::new(remote));
    let dev = Device::in_memory("A", flaky.clone(), time.clone(), SyncSettings::default());
    dev.notes().create(note("lec", "x", 0)).await.unwrap();

    flaky.fail_upserts(1, Fault::Rejected);
    time.set(2_000);
    let report = dev.sync().await;

    assert!(matches!(report.outcome, CycleOutcome::Failed(_)));
    assert!(!report.outcome.is_success());
    assert_eq!(dev.watermark().await, 0);
    assert_eq!(dev.auth.clear_count(), 0);
}

#[tokio::test]
async fn test_signed_out_device_does_not_touch_remote() {
    let time = manual_time(1_000);
    let remote = Arc::new(MemoryRemoteStore::new().with_time_source(time.clone()));
    let flaky = Arc::new(FlakyRemote::new(remote));
    let dev = Device::in_memory("A", flaky.clone(), time.clone(), SyncSettings::default());
    dev.notes().create(note("lec", "x", 0)).await.unwrap();
    dev.auth.sign_out();

    let report = dev.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Skipped);
    assert!(report.outcome.is_success());
    assert_eq!(flaky.upsert_calls(), 0);
    assert_eq!(flaky.fetch_calls(), 0);
    assert_eq!(dev.watermark().await, 0);
}

#[tokio::test]
async fn test_undecodable_remote_document_does_not_block_sync() {
    let time = manual_time(1_000);
    let remote = Arc::new(MemoryRemoteStore::new().with_time_source(time.clone()));
    let a = Device::in_memory("A", remote.clone(), time.clone(), SyncSettings::default());
    let b = Device::in_memory("B", remote.clone(), time.clone(), SyncSettings::default());

    let good = a.notes().create(note("lec", "valid", 0)).await.unwrap();
    time.set(2_000);
    a.sync().await;

    // Written by some other client without an hlc.
    remote.put_raw(
        USER,
        EntityKind::Note,
        "broken",
        serde_json::json!({
            "id": "broken",
            "body": { "content": "???" },
            "is_deleted": false,
            "updated_at": 1_500,
            "written_at": 2_000,
        }),
    );

    time.set(3_000);
    let report = b.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.merged().inserted, 1);
    assert!(b.notes().get(&good.id).await.unwrap().is_some());
    assert_eq!(b.watermark().await, 3_000);

    time.set(4_000);
    assert_eq!(b.sync().await.outcome, CycleOutcome::Completed);
    assert_eq!(b.watermark().await, 4_000);
}
