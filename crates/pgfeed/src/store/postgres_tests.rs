//! Postgres store tests against a real database.
//!
//! # Purpose
//! Exercise the Postgres backend with real SQL: schema and migrations,
//! advisory-lock coordination, sweep assignment, incident recovery, and
//! LISTEN/NOTIFY longpoll.
//!
//! # How to use
//! Run with `cargo test -p pgfeed --features pg-tests`. Tests need a
//! reachable database named by `PGFEED_TEST_DATABASE_URL` (or
//! `DATABASE_URL`) and skip gracefully when neither is set.
//!
//! # Key invariants
//! - Tests are serialized: they share the `changefeed` schema and the
//!   server-wide advisory lock space.
//! - Each test resets the schema to a clean baseline first.
use super::postgres::PostgresStore;
use super::{ChangefeedStore, StoreConfig};
use crate::config::PostgresConfig;
use crate::cursor::Cursor;
use crate::model::{FeedOptions, SignalOutcome, TransactionOptions, SEQUENCE_BASE};
use serial_test::serial;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

fn pg_url() -> Option<String> {
    match std::env::var("PGFEED_TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("skipping pg-tests: PGFEED_TEST_DATABASE_URL not set");
            None
        }
    }
}

async fn reset(pool: &PgPool) {
    sqlx::query(
        "TRUNCATE changefeed.change, changefeed.shard, changefeed.feed, changefeed.incident \
         RESTART IDENTITY",
    )
    .execute(pool)
    .await
    .expect("reset changefeed schema");
}

/// Connect (running migrations) and reset, or `None` when no database
/// is configured.
async fn store_with(config: StoreConfig) -> Option<PostgresStore> {
    let pg = PostgresConfig {
        url: pg_url()?,
        max_connections: 8,
        acquire_timeout_ms: 10_000,
    };
    let store = PostgresStore::connect(&pg, config).await.expect("connect");
    reset(store.pool()).await;
    Some(store)
}

#[tokio::test]
#[serial]
async fn outbox_sweep_assigns_order_and_pages() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let feed = Uuid::new_v4();
    store.ensure_feed(feed, FeedOptions::outbox(1)).await?;

    for n in 0..3 {
        store
            .insert_outbox(feed, 0, Some(1_700_000_000_000 + n), serde_json::json!({ "n": n }))
            .await?;
    }
    store
        .insert_outbox(feed, 1, None, serde_json::json!({ "n": 99 }))
        .await?;

    // Unswept rows are invisible to readers.
    let page = store.read_feed(feed, 0, Cursor::START, None).await?;
    assert!(page.events.is_empty());
    assert_eq!(page.next_cursor, Cursor::START);

    let guard = store
        .lock_sweep_group(1, Duration::from_secs(1))
        .await?
        .expect("sweeper lock free");
    let stats = store.sweep_once(1).await?;
    guard.release().await?;
    assert_eq!(stats.iter().map(|s| s.changes_assigned).sum::<i64>(), 4);
    let shard0 = stats.iter().find(|s| s.shard_id == 0).expect("shard 0");
    assert_eq!(shard0.changes_assigned, 3);
    assert_eq!(shard0.last_sequence_number_before, SEQUENCE_BASE);

    // Ordered page with dense sequence numbers from the base.
    let page = store.read_feed(feed, 0, Cursor::START, Some(2)).await?;
    assert_eq!(page.events.len(), 2);
    assert_eq!(page.events[0].sequence_number, Some(SEQUENCE_BASE + 1));
    assert_eq!(page.events[1].sequence_number, Some(SEQUENCE_BASE + 2));
    assert!(page.events[0].ulid < page.events[1].ulid);

    // Resume from the returned cursor.
    let rest = store.read_feed(feed, 0, page.next_cursor, None).await?;
    assert_eq!(rest.events.len(), 1);
    assert_eq!(rest.events[0].sequence_number, Some(SEQUENCE_BASE + 3));

    assert_eq!(
        store.last_sequence_number(feed, 0).await?,
        SEQUENCE_BASE + 3
    );
    assert_eq!(
        store.last_sequence_number(feed, 1).await?,
        SEQUENCE_BASE + 1
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn resweep_resumes_where_the_last_batch_stopped() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let feed = Uuid::new_v4();
    store.ensure_feed(feed, FeedOptions::outbox(2)).await?;

    store.insert_outbox(feed, 0, None, serde_json::json!({})).await?;
    store.insert_outbox(feed, 0, None, serde_json::json!({})).await?;
    store.sweep_once(2).await?;

    store.insert_outbox(feed, 0, None, serde_json::json!({})).await?;
    let stats = store.sweep_once(2).await?;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].last_sequence_number_before, SEQUENCE_BASE + 2);
    assert_eq!(
        store.last_sequence_number(feed, 0).await?,
        SEQUENCE_BASE + 3
    );

    // Nothing left: an empty sweep reports no shards.
    assert!(store.sweep_once(2).await?.is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn blocking_writer_assigns_at_commit_and_continues_keys() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let feed = Uuid::new_v4();
    store.ensure_feed(feed, FeedOptions::blocking()).await?;

    let hint = 1_700_000_000_000;
    let mut txn = store
        .begin(
            feed,
            0,
            TransactionOptions {
                time_hint_ms: Some(hint),
            },
        )
        .await?;
    let first = txn.insert_change(serde_json::json!({ "n": 0 })).await?;
    let second = txn.insert_change(serde_json::json!({ "n": 1 })).await?;
    assert_eq!(first.prefix(), second.prefix());
    assert_eq!(second.suffix(), first.suffix() + 1);
    txn.commit().await?;

    // Committed rows are immediately readable with sequence numbers;
    // no sweeper ever touches a blocking feed.
    let page = store.read_feed(feed, 0, Cursor::START, None).await?;
    assert_eq!(page.events.len(), 2);
    assert_eq!(page.events[0].sequence_number, Some(SEQUENCE_BASE + 1));
    assert_eq!(
        store.last_sequence_number(feed, 0).await?,
        SEQUENCE_BASE + 2
    );

    // Same time hint: the next handle continues the suffix run exactly.
    let mut txn = store
        .begin(
            feed,
            0,
            TransactionOptions {
                time_hint_ms: Some(hint),
            },
        )
        .await?;
    let third = txn.insert_change(serde_json::json!({ "n": 2 })).await?;
    assert_eq!(third.prefix(), second.prefix());
    assert_eq!(third.suffix(), second.suffix() + 1);
    txn.commit().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn rollback_leaves_no_rows_and_no_sequence_movement() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let feed = Uuid::new_v4();
    store.ensure_feed(feed, FeedOptions::blocking()).await?;

    let mut txn = store.begin(feed, 0, TransactionOptions::default()).await?;
    txn.insert_change(serde_json::json!({ "doomed": true })).await?;
    txn.rollback().await?;

    assert!(store
        .read_feed(feed, 0, Cursor::START, None)
        .await?
        .events
        .is_empty());
    assert_eq!(store.last_sequence_number(feed, 0).await?, SEQUENCE_BASE);

    // The lock was released: a fresh writer proceeds immediately.
    let mut txn = store.begin(feed, 0, TransactionOptions::default()).await?;
    txn.insert_change(serde_json::json!({ "ok": true })).await?;
    txn.commit().await?;
    assert_eq!(
        store.last_sequence_number(feed, 0).await?,
        SEQUENCE_BASE + 1
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn sweep_group_lock_is_exclusive_per_group() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let held = store
        .lock_sweep_group(5, Duration::from_secs(1))
        .await?
        .expect("first sweeper");

    // Same group: busy. Zero wait exercises the non-blocking form.
    assert!(store.lock_sweep_group(5, Duration::ZERO).await?.is_none());
    assert!(store
        .lock_sweep_group(5, Duration::from_millis(50))
        .await?
        .is_none());

    // Different group: independent.
    let other = store
        .lock_sweep_group(6, Duration::from_millis(50))
        .await?
        .expect("other group");
    other.release().await?;

    held.release().await?;
    let reacquired = store
        .lock_sweep_group(5, Duration::from_millis(200))
        .await?
        .expect("released lock");
    reacquired.release().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn stalled_writer_is_burned_and_counted_as_incident() -> anyhow::Result<()> {
    let config = StoreConfig {
        lock_timeout: Duration::from_millis(100),
        incident_stall_threshold: Duration::from_millis(200),
        ..StoreConfig::default()
    };
    let Some(store) = store_with(config).await else {
        return Ok(());
    };
    let feed = Uuid::new_v4();
    store.ensure_feed(feed, FeedOptions::blocking()).await?;

    // A writer that stops mid-transaction: its session sits
    // idle-in-transaction holding the shard lock.
    let stuck = store.begin(feed, 0, TransactionOptions::default()).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The next writer times out, inspects the holder, terminates the
    // stalled backend, and acquires.
    let mut txn = store.begin(feed, 0, TransactionOptions::default()).await?;
    txn.insert_change(serde_json::json!({ "recovered": true })).await?;
    txn.commit().await?;

    assert_eq!(store.incident_count(feed, 0).await?, 1);
    assert_eq!(
        store.last_sequence_number(feed, 0).await?,
        SEQUENCE_BASE + 1
    );

    // The burned writer's session is gone; finishing it fails.
    assert!(stuck.commit().await.is_err());
    Ok(())
}

#[tokio::test]
#[serial]
async fn longpoll_signal_arrives_with_the_swept_rows() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let store = std::sync::Arc::new(store);
    let feed = Uuid::new_v4();
    store
        .ensure_feed(feed, FeedOptions::outbox(3).with_longpoll())
        .await?;
    store.ensure_shard(feed, 0).await?;

    let guard = store
        .lock_sweep_group(3, Duration::from_secs(1))
        .await?
        .expect("sweeper lock");

    let writer = std::sync::Arc::clone(&store);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        writer
            .insert_outbox(feed, 0, None, serde_json::json!({ "wake": true }))
            .await
            .expect("insert");
        writer.sweep_once(3).await.expect("sweep");
    });

    let outcome = store
        .wait_for_signal(feed, 0, SEQUENCE_BASE, Duration::from_secs(5))
        .await?;
    assert_eq!(outcome, SignalOutcome::Signaled);
    // Woken waiters always find the rows already visible.
    assert_eq!(
        store.last_sequence_number(feed, 0).await?,
        SEQUENCE_BASE + 1
    );
    handle.await.expect("writer task");
    guard.release().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn longpoll_without_a_sweeper_is_detected() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let feed = Uuid::new_v4();
    store
        .ensure_feed(feed, FeedOptions::outbox(4).with_longpoll())
        .await?;
    store.ensure_shard(feed, 0).await?;

    // Nobody holds group 4: a waiter would hang forever, so the store
    // says so instead of timing out.
    let outcome = store
        .wait_for_signal(feed, 0, SEQUENCE_BASE, Duration::from_secs(5))
        .await?;
    assert_eq!(outcome, SignalOutcome::NoSweeper);
    Ok(())
}

#[tokio::test]
#[serial]
async fn sweep_numbers_continue_from_an_externally_advanced_counter() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let feed = Uuid::new_v4();
    store.ensure_feed(feed, FeedOptions::outbox(7)).await?;
    store.insert_outbox(feed, 0, None, serde_json::json!({})).await?;

    // Another assigner moved the counter before our sweep started. The
    // sweep reads the fresh value and numbers densely from it.
    sqlx::query(
        "UPDATE changefeed.shard SET last_sequence_number = last_sequence_number + 1 \
         WHERE feed_id = $1 AND shard_id = 0",
    )
    .bind(feed)
    .execute(store.pool())
    .await?;

    let stats = store.sweep_once(7).await?;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].last_sequence_number_before, SEQUENCE_BASE + 1);
    assert_eq!(
        store.last_sequence_number(feed, 0).await?,
        SEQUENCE_BASE + 2
    );

    // Rows that gained a number behind the sweeper's back drop out of
    // the next batch entirely.
    store.insert_outbox(feed, 0, None, serde_json::json!({})).await?;
    sqlx::query(
        "UPDATE changefeed.change SET change_sequence_number = $1 \
         WHERE feed_id = $2 AND change_sequence_number IS NULL",
    )
    .bind(SEQUENCE_BASE + 100)
    .bind(feed)
    .execute(store.pool())
    .await?;
    // All rows now carry numbers; the sweep sees an empty batch.
    assert!(store.sweep_once(7).await?.is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn ensure_feed_is_idempotent_and_keeps_first_options() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let feed = Uuid::new_v4();
    store.ensure_feed(feed, FeedOptions::outbox(9)).await?;
    store.ensure_feed(feed, FeedOptions::blocking()).await?;

    // Still an outbox feed: rows stay unordered until group 9 sweeps.
    store.insert_outbox(feed, 0, None, serde_json::json!({})).await?;
    assert!(store
        .read_feed(feed, 0, Cursor::START, None)
        .await?
        .events
        .is_empty());
    let stats = store.sweep_once(9).await?;
    assert_eq!(stats.len(), 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn a_contended_sweeper_leaves_its_session_settings_clean() -> anyhow::Result<()> {
    let Some(holder) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let held = holder
        .lock_sweep_group(11, Duration::from_secs(1))
        .await?
        .expect("first sweeper");

    // A single-connection pool: every statement below runs on the same
    // session that just lost the bounded-wait race.
    let pg = PostgresConfig {
        url: pg_url().ok_or_else(|| anyhow::anyhow!("url gone"))?,
        max_connections: 1,
        acquire_timeout_ms: 10_000,
    };
    let contender = PostgresStore::connect(&pg, StoreConfig::default()).await?;
    assert!(contender
        .lock_sweep_group(11, Duration::from_millis(50))
        .await?
        .is_none());

    // The 50ms lock_timeout must not outlive the failed attempt.
    let (timeout,): (String,) = sqlx::query_as("SHOW lock_timeout")
        .fetch_one(contender.pool())
        .await?;
    assert_ne!(timeout, "50ms");

    // And unrelated lock waits on that session still get the full wait:
    // a fresh attempt with a generous budget succeeds once the holder
    // lets go.
    held.release().await?;
    let reacquired = contender
        .lock_sweep_group(11, Duration::from_millis(500))
        .await?
        .expect("lock free again");
    reacquired.release().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn a_failed_commit_releases_the_writer_lock() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    let feed = Uuid::new_v4();
    store.ensure_feed(feed, FeedOptions::blocking()).await?;

    let mut txn = store.begin(feed, 0, TransactionOptions::default()).await?;
    txn.insert_change(serde_json::json!({ "n": 0 })).await?;

    // The writer's backend dies out from under it, as a server crash
    // or admin kill would. Its session is the only one sitting
    // idle-in-transaction.
    sqlx::query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE state = 'idle in transaction' \
           AND datname = current_database() \
           AND pid <> pg_backend_pid()",
    )
    .execute(store.pool())
    .await?;
    assert!(txn.commit().await.is_err());

    // Nothing lingers: the uncommitted insert is gone, the shard lock
    // is free, the pool discards the dead connection, and the next
    // writer proceeds immediately without burning anyone.
    let mut txn = store.begin(feed, 0, TransactionOptions::default()).await?;
    txn.insert_change(serde_json::json!({ "n": 1 })).await?;
    txn.commit().await?;
    assert_eq!(store.incident_count(feed, 0).await?, 0);
    assert_eq!(
        store.last_sequence_number(feed, 0).await?,
        SEQUENCE_BASE + 1
    );
    let page = store.read_feed(feed, 0, Cursor::START, None).await?;
    assert_eq!(page.events.len(), 1);
    Ok(())
}

#[test]
#[serial]
fn dropping_a_transaction_after_runtime_shutdown_does_not_panic() {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let Some((_store, txn)) = rt.block_on(async {
        let Some(store) = store_with(StoreConfig::default()).await else {
            return None;
        };
        let feed = Uuid::new_v4();
        store
            .ensure_feed(feed, FeedOptions::blocking())
            .await
            .expect("ensure feed");
        let txn = store
            .begin(feed, 0, TransactionOptions::default())
            .await
            .expect("begin");
        Some((store, txn))
    }) else {
        return;
    };

    // No runtime left: the drop path must fall back to closing the
    // connection outright instead of trying to spawn a rollback task.
    drop(rt);
    drop(txn);
}

#[tokio::test]
#[serial]
async fn health_check_reaches_the_database() -> anyhow::Result<()> {
    let Some(store) = store_with(StoreConfig::default()).await else {
        return Ok(());
    };
    store.health_check().await?;
    assert!(store.is_durable());
    assert_eq!(store.backend_name(), "postgres");
    Ok(())
}
