//! End-to-end outbox flow on the in-memory store: insertion, sweep
//! assignment across shards and groups, and cursor paging.
use pgfeed::store::memory::MemoryStore;
use pgfeed::{
    sweep, sweep_loop, ChangefeedStore, Cursor, FeedOptions, StoreConfig, SweepLoopOptions,
    SEQUENCE_BASE,
};
use std::time::Duration;
use uuid::Uuid;

fn store() -> MemoryStore {
    MemoryStore::new(StoreConfig::default())
}

#[tokio::test]
async fn sweep_assigns_dense_order_per_shard_within_a_group() {
    let store = store();
    let orders = Uuid::new_v4();
    let audit = Uuid::new_v4();
    store
        .ensure_feed(orders, FeedOptions::outbox(0))
        .await
        .unwrap();
    store
        .ensure_feed(audit, FeedOptions::outbox(1))
        .await
        .unwrap();

    // Interleave inserts across shards so physical order mixes them.
    for n in 0..4i64 {
        store
            .insert_outbox(orders, 0, Some(1_700_000_000_000 + n), serde_json::json!({ "n": n }))
            .await
            .unwrap();
        if n < 2 {
            store
                .insert_outbox(orders, 1, None, serde_json::json!({ "other": n }))
                .await
                .unwrap();
        }
    }
    store
        .insert_outbox(audit, 0, None, serde_json::json!({ "audit": true }))
        .await
        .unwrap();

    // Nothing visible before the sweep.
    assert!(store
        .read_feed(orders, 0, Cursor::START, None)
        .await
        .unwrap()
        .events
        .is_empty());

    let stats = sweep(&store, 0).await.unwrap();
    assert_eq!(stats.len(), 2);
    let shard0 = stats.iter().find(|s| s.shard_id == 0).unwrap();
    let shard1 = stats.iter().find(|s| s.shard_id == 1).unwrap();
    assert_eq!(shard0.changes_assigned, 4);
    assert_eq!(shard1.changes_assigned, 2);
    assert_eq!(shard0.last_sequence_number_before, SEQUENCE_BASE);
    assert_eq!(shard1.last_sequence_number_before, SEQUENCE_BASE);

    // The other group's feed stays unswept.
    assert!(store
        .read_feed(audit, 0, Cursor::START, None)
        .await
        .unwrap()
        .events
        .is_empty());

    // Each shard numbers densely from the base, independently.
    let page = store.read_feed(orders, 0, Cursor::START, None).await.unwrap();
    let sequence_numbers: Vec<i64> = page
        .events
        .iter()
        .map(|e| e.sequence_number.unwrap())
        .collect();
    assert_eq!(
        sequence_numbers,
        vec![
            SEQUENCE_BASE + 1,
            SEQUENCE_BASE + 2,
            SEQUENCE_BASE + 3,
            SEQUENCE_BASE + 4
        ]
    );
    assert!(page.events.windows(2).all(|w| w[0].ulid < w[1].ulid));

    // A later sweep resumes exactly where this one stopped.
    store
        .insert_outbox(orders, 0, None, serde_json::json!({ "late": true }))
        .await
        .unwrap();
    let stats = sweep(&store, 0).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].last_sequence_number_before, SEQUENCE_BASE + 4);
    assert_eq!(
        store.last_sequence_number(orders, 0).await.unwrap(),
        SEQUENCE_BASE + 5
    );
}

#[tokio::test]
async fn out_of_order_time_hints_still_yield_increasing_keys() {
    let store = store();
    let feed = Uuid::new_v4();
    store
        .ensure_feed(feed, FeedOptions::outbox(0))
        .await
        .unwrap();

    // Hints arrive newest-first; assignment follows insertion order and
    // corrects stale hints forward instead of honoring them backward.
    let newest = 1_700_000_500_000i64;
    for n in 0..5i64 {
        store
            .insert_outbox(feed, 0, Some(newest - n * 1000), serde_json::json!({ "n": n }))
            .await
            .unwrap();
    }
    sweep(&store, 0).await.unwrap();

    let page = store.read_feed(feed, 0, Cursor::START, None).await.unwrap();
    assert_eq!(page.events.len(), 5);
    assert!(page.events.windows(2).all(|w| w[0].ulid < w[1].ulid));
    for event in &page.events {
        assert!(event.ulid.timestamp_ms() >= newest);
    }
    // Insertion order is preserved even though the hints ran backward.
    let ns: Vec<i64> = page
        .events
        .iter()
        .map(|e| e.payload["n"].as_i64().unwrap())
        .collect();
    assert_eq!(ns, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn cursor_pages_resume_without_loss_or_duplication() {
    let store = store();
    let feed = Uuid::new_v4();
    store
        .ensure_feed(feed, FeedOptions::outbox(0))
        .await
        .unwrap();
    for n in 0..10i64 {
        store
            .insert_outbox(feed, 0, None, serde_json::json!({ "n": n }))
            .await
            .unwrap();
    }
    sweep(&store, 0).await.unwrap();

    let mut cursor = Cursor::START;
    let mut collected = Vec::new();
    loop {
        let page = store.read_feed(feed, 0, cursor, Some(3)).await.unwrap();
        if page.events.is_empty() {
            // Empty page echoes the cursor back unchanged.
            assert_eq!(page.next_cursor, cursor);
            break;
        }
        collected.extend(page.events.iter().map(|e| e.payload["n"].as_i64().unwrap()));
        cursor = page.next_cursor;
    }
    assert_eq!(collected, (0..10).collect::<Vec<i64>>());
}

#[tokio::test]
async fn page_size_is_clamped_to_the_configured_maximum() {
    let store = MemoryStore::new(StoreConfig {
        page_size_max: 4,
        ..StoreConfig::default()
    });
    let feed = Uuid::new_v4();
    store
        .ensure_feed(feed, FeedOptions::outbox(0))
        .await
        .unwrap();
    for _ in 0..8 {
        store
            .insert_outbox(feed, 0, None, serde_json::json!({}))
            .await
            .unwrap();
    }
    sweep(&store, 0).await.unwrap();

    let page = store
        .read_feed(feed, 0, Cursor::START, Some(1000))
        .await
        .unwrap();
    assert_eq!(page.events.len(), 4);
}

#[tokio::test]
async fn sweep_loop_drains_a_group_and_reports_totals() {
    let store = store();
    let feed = Uuid::new_v4();
    store
        .ensure_feed(feed, FeedOptions::outbox(0))
        .await
        .unwrap();
    for _ in 0..25 {
        store
            .insert_outbox(feed, 0, None, serde_json::json!({}))
            .await
            .unwrap();
    }

    let totals = sweep_loop(
        &store,
        0,
        SweepLoopOptions {
            wait: Duration::from_millis(100),
            duration: Duration::from_millis(50),
            sleep: Duration::from_millis(1),
        },
    )
    .await
    .unwrap();
    assert_eq!(totals.changes_assigned, 25);
    assert!(totals.iterations >= 1);
    assert_eq!(totals.races_detected, 0);
}

#[tokio::test]
async fn sweep_loop_yields_when_another_sweeper_owns_the_group() {
    let store = store();
    let feed = Uuid::new_v4();
    store
        .ensure_feed(feed, FeedOptions::outbox(0))
        .await
        .unwrap();
    store
        .insert_outbox(feed, 0, None, serde_json::json!({}))
        .await
        .unwrap();

    let guard = store
        .lock_sweep_group(0, Duration::from_millis(100))
        .await
        .unwrap()
        .expect("first owner");

    // Contended loop: zero totals, no error, nothing assigned.
    let totals = sweep_loop(
        &store,
        0,
        SweepLoopOptions {
            wait: Duration::from_millis(20),
            duration: Duration::from_millis(20),
            sleep: Duration::from_millis(1),
        },
    )
    .await
    .unwrap();
    assert_eq!(totals.changes_assigned, 0);
    assert_eq!(totals.iterations, 0);
    assert!(store
        .read_feed(feed, 0, Cursor::START, None)
        .await
        .unwrap()
        .events
        .is_empty());

    guard.release().await.unwrap();
}
