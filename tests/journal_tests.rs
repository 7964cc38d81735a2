//! End-to-end journal scenarios against the in-memory store: ordering,
//! part/file/directory rollover, fault tolerance, sharding.
//!
//! Run with: cargo test --test journal_tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    FaultInjector, OutageStore, TestClock, numbered_entries, read_back, test_config, test_tuning,
};
use drift::error::JournalError;
use drift::store::MemoryStore;
use drift::{Journal, JournalBuilder};
use tempfile::TempDir;

#[tokio::test]
async fn happy_path_preserves_submission_order() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::at(2026, 3, 1, 12);

    let mut journal = Journal::<String>::builder(test_config(dir.path(), 25))
        .storage(store.clone())
        .clock(clock.as_fn())
        .tuning(test_tuning())
        .open()
        .await
        .unwrap();

    let entries = numbered_entries(1, 3000);
    for entry in &entries {
        journal.submit(entry.clone()).await.unwrap();
    }

    let stats = journal.stats().await;
    assert_eq!(stats.enqueued, 3000);

    journal.close().await.unwrap();

    assert_eq!(read_back(&store, "2026/03/01/"), entries);
    assert_eq!(store.pending_upload_count(), 0);
    assert!(!store.objects_with_prefix("2026/03/01/").is_empty());
}

#[tokio::test]
async fn close_settles_all_counters() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let mut journal = Journal::<String>::builder(test_config(dir.path(), 50))
        .storage(store.clone())
        .clock(TestClock::at(2026, 3, 1, 12).as_fn())
        .tuning(test_tuning())
        .open()
        .await
        .unwrap();

    for entry in numbered_entries(1, 500) {
        journal.submit(entry).await.unwrap();
    }
    journal.close().await.unwrap();

    let stats = journal.stats().await;
    assert_eq!(stats.enqueued, 500);
    assert_eq!(stats.uploaded, 500);
    assert_eq!(stats.queue.in_progress, 0);
}

#[tokio::test]
async fn parts_are_dense_and_non_final_parts_exceed_minimum() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let tuning = test_tuning();

    let mut journal = Journal::<String>::builder(test_config(dir.path(), 25))
        .storage(store.clone())
        .clock(TestClock::at(2026, 3, 1, 12).as_fn())
        .tuning(tuning.clone())
        .open()
        .await
        .unwrap();

    for entry in numbered_entries(1, 2000) {
        journal.submit(entry).await.unwrap();
    }
    journal.close().await.unwrap();

    let objects = store.objects_with_prefix("2026/03/01/");
    assert!(objects.len() > 1, "expected multiple files");

    for (index, (key, object)) in objects.iter().enumerate() {
        let expected_key = format!("2026/03/01/app-{index:06}.journal");
        assert_eq!(*key, expected_key, "file numbers must be dense");

        let numbers: Vec<i32> = object.parts.iter().map(|(number, _)| *number).collect();
        let expected: Vec<i32> = (1..=numbers.len() as i32).collect();
        assert_eq!(numbers, expected, "part numbers must be a dense 1..k run");
        assert!(numbers.len() as u64 <= tuning.max_parts_per_file);

        for (number, size) in &object.parts[..object.parts.len() - 1] {
            assert!(
                *size > tuning.min_part_size,
                "non-final part {number} of {key} is only {size} bytes"
            );
        }
    }
}

#[tokio::test]
async fn random_transient_failures_do_not_reorder_or_duplicate() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let flaky = FaultInjector::new(store.clone(), 1.0 / 3.0, 42);

    let mut journal = Journal::<String>::builder(test_config(dir.path(), 25))
        .storage(Arc::new(flaky))
        .clock(TestClock::at(2026, 3, 1, 12).as_fn())
        .tuning(test_tuning())
        .open()
        .await
        .unwrap();

    let entries = numbered_entries(1, 1500);
    for entry in &entries {
        journal.submit(entry.clone()).await.unwrap();
    }
    journal.close().await.unwrap();

    assert_eq!(read_back(&store, "2026/03/01/"), entries);
    assert_eq!(store.pending_upload_count(), 0);

    // a retried part must not be referenced twice by the completion
    for (key, object) in store.objects_with_prefix("2026/03/01/") {
        let mut numbers: Vec<i32> = object.parts.iter().map(|(number, _)| *number).collect();
        let total = numbers.len();
        numbers.dedup();
        assert_eq!(numbers.len(), total, "duplicate part number in {key}");
    }

    let stats = journal.stats().await;
    assert_eq!(stats.uploaded, 1500);
    assert!(stats.queue.retried > 0, "expected faults to force retries");
}

#[tokio::test]
async fn streaked_outages_eventually_drain() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let outage = OutageStore::new(
        store.clone(),
        Duration::from_millis(250),
        Duration::from_millis(25),
    );

    let mut journal = Journal::<String>::builder(test_config(dir.path(), 25))
        .storage(Arc::new(outage))
        .clock(TestClock::at(2026, 3, 1, 12).as_fn())
        .tuning(test_tuning())
        .open()
        .await
        .unwrap();

    let entries = numbered_entries(1, 1000);
    for entry in &entries {
        journal.submit(entry.clone()).await.unwrap();
    }
    journal.close().await.unwrap();

    assert_eq!(read_back(&store, "2026/03/01/"), entries);
    assert_eq!(store.pending_upload_count(), 0);
}

#[tokio::test]
async fn directory_rollover_splits_output_cleanly() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let clock = TestClock::at(2026, 3, 1, 23);

    let mut journal = Journal::<String>::builder(test_config(dir.path(), 5))
        .storage(store.clone())
        .clock(clock.as_fn())
        .tuning(test_tuning())
        .open()
        .await
        .unwrap();

    for entry in numbered_entries(1, 20) {
        journal.submit(entry).await.unwrap();
    }
    // let the size-triggered flushes land before the day changes
    tokio::time::sleep(Duration::from_millis(300)).await;

    clock.set(2026, 3, 2, 0);
    for entry in numbered_entries(21, 40) {
        journal.submit(entry).await.unwrap();
    }
    journal.close().await.unwrap();

    assert_eq!(read_back(&store, "2026/03/01/"), numbered_entries(1, 20));
    assert_eq!(read_back(&store, "2026/03/02/"), numbered_entries(21, 40));
    // boundary-straddling uploads must be ended, not orphaned
    assert_eq!(store.pending_upload_count(), 0);
}

#[tokio::test]
async fn file_rollover_restarts_part_numbering() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut tuning = test_tuning();
    tuning.max_parts_per_file = 2;
    tuning.min_part_size = 64;

    let mut journal = Journal::<String>::builder(test_config(dir.path(), 20))
        .storage(store.clone())
        .clock(TestClock::at(2026, 3, 1, 12).as_fn())
        .tuning(tuning)
        .open()
        .await
        .unwrap();

    let entries: Vec<String> = (1..=240).map(|n| format!("{n:05}")).collect();
    for entry in &entries {
        journal.submit(entry.clone()).await.unwrap();
    }
    journal.close().await.unwrap();

    let objects = store.objects_with_prefix("2026/03/01/");
    assert!(objects.len() >= 3, "expected several rolled files");

    for (index, (key, object)) in objects.iter().enumerate() {
        assert_eq!(*key, format!("2026/03/01/app-{index:06}.journal"));
        let numbers: Vec<i32> = object.parts.iter().map(|(number, _)| *number).collect();
        assert_eq!(numbers[0], 1, "part numbering must restart per file");
        assert!(numbers.len() <= 2);
    }
    assert_eq!(read_back(&store, "2026/03/01/"), entries);
}

#[tokio::test]
async fn submit_after_close_fails_fast() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let mut journal = Journal::<String>::builder(test_config(dir.path(), 10))
        .storage(store.clone())
        .tuning(test_tuning())
        .open()
        .await
        .unwrap();

    journal.close().await.unwrap();
    let result = journal.submit("late".to_string()).await;
    assert!(matches!(result, Err(JournalError::Closed)));
}

#[tokio::test]
async fn empty_journal_leaves_no_orphan_uploads() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let mut journal = Journal::<String>::builder(test_config(dir.path(), 10))
        .storage(store.clone())
        .clock(TestClock::at(2026, 3, 1, 12).as_fn())
        .tuning(test_tuning())
        .open()
        .await
        .unwrap();
    journal.close().await.unwrap();

    assert_eq!(store.pending_upload_count(), 0);
    assert!(store.objects_with_prefix("").is_empty());
}

#[tokio::test]
async fn custom_encoder_and_compressor_are_applied() {
    #[derive(Clone)]
    struct Event {
        id: u64,
    }

    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut config = test_config(dir.path(), 4);
    // no latency flushes: the four events must land in one chunk
    config.max_batch_latency_ms = None;

    let mut journal =
        JournalBuilder::with_encoder(config, |event: &Event| {
            format!("event-{}", event.id).into_bytes()
        })
        .compressor(|bytes| {
            let mut out = b"C:".to_vec();
            out.extend_from_slice(bytes);
            out
        })
        .storage(store.clone())
        .clock(TestClock::at(2026, 3, 1, 12).as_fn())
        .tuning(test_tuning())
        .open()
        .await
        .unwrap();

    for id in 1..=4 {
        journal.submit(Event { id }).await.unwrap();
    }
    journal.close().await.unwrap();

    let objects = store.objects_with_prefix("2026/03/01/");
    assert_eq!(objects.len(), 1);
    assert_eq!(
        objects[0].1.bytes,
        b"C:event-1\nevent-2\nevent-3\nevent-4\n"
    );
}

#[tokio::test]
async fn sharded_journal_round_robins_and_merges_stats() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    // shard queue directories are the configured path with the shard
    // symbol appended, so keep them inside the temp dir
    let mut config = test_config(&dir.path().join("queue"), 10);
    config.shards = Some(3);

    let mut journal = Journal::<String>::builder(config)
        .storage(store.clone())
        .clock(TestClock::at(2026, 3, 1, 12).as_fn())
        .tuning(test_tuning())
        .open_sharded()
        .await
        .unwrap();
    assert_eq!(journal.shard_count(), 3);

    let entries = numbered_entries(1, 300);
    for entry in &entries {
        journal.submit(entry.clone()).await.unwrap();
    }
    journal.close().await.unwrap();

    let stats = journal.stats().await;
    assert_eq!(stats.enqueued, 300);
    assert_eq!(stats.uploaded, 300);
    assert_eq!(stats.queue.in_progress, 0);

    // each shard holds every third entry, in submission order
    for shard in 0..3u64 {
        let expected: Vec<String> = entries
            .iter()
            .skip(shard as usize)
            .step_by(3)
            .cloned()
            .collect();
        let prefix = format!("{}/2026/03/01/", drift::shard::shard_symbol(shard as u32));
        assert_eq!(read_back(&store, &prefix), expected);
    }
}
