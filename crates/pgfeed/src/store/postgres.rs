//! Postgres-backed implementation of the changefeed store.
//!
//! # What this module is
//! Maps the coordination substrate onto Postgres primitives:
//!
//! - **Writer locks**: `pg_advisory_xact_lock` on a 64-bit key derived
//!   from the (feed, shard) pair, so the lock releases with the
//!   transaction no matter how the session ends.
//! - **Sweeper locks**: session-scoped `pg_advisory_lock(class, group)`
//!   held on a dedicated pooled connection for the lifetime of a sweep
//!   loop. `pg_locks` makes the holder visible to longpollers.
//! - **Incident recovery**: a blocked writer inspects the current lock
//!   holder through `pg_locks`/`pg_stat_activity` and terminates a
//!   backend that has sat idle-in-transaction past the stall threshold.
//! - **Wakeup signal**: `pg_notify` on a per-shard channel, sent inside
//!   the assigning transaction so delivery is commit-atomic and a
//!   waiter can never observe the notification before the rows.
//!
//! # Key invariants
//! - ULID keys and sequence numbers are computed in Rust and written
//!   back conditionally; an affected-row count that differs from the
//!   batch size means another assigner interleaved and the whole batch
//!   rolls back ([`FeedError::Race`]).
//! - Writer transactions run at READ COMMITTED: the shard-state read
//!   happens *after* the advisory lock is granted and therefore sees
//!   the previous holder's commit.
//! - `change_id` comes from an identity column and is never reused, so
//!   sweep batches observe rows in true insertion order.
//!
//! # Operational notes
//! - Migrations run at startup via `sqlx::migrate!("./migrations")`.
//! - Database URLs may contain credentials; they are never logged.
//! - Pool sizing bounds concurrent writers; every blocking writer and
//!   every sweep loop pins one connection while active.
use super::{
    ChangefeedStore, FeedError, FeedResult, FeedTransaction, LockAttempt, StoreConfig, SweepGuard,
};
use crate::config::PostgresConfig;
use crate::cursor::Cursor;
use crate::lock::{acquire_with_recovery, LockAttemptPort, LockPolicy};
use crate::model::{
    unix_millis, FeedEvent, FeedId, FeedOptions, FeedPage, ShardId, ShardSweepStats, SignalOutcome,
    SweepGroup, TransactionOptions, SEQUENCE_BASE,
};
use crate::ulid::{ChangeUlid, UlidState};
use async_trait::async_trait;
use fnv::FnvHasher;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::{Acquire, Executor, FromRow, PgPool, Postgres};
use std::collections::HashMap;
use std::hash::Hasher;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// `classid` for the two-int advisory lock form used by sweeper locks.
/// Fixed and positive so it round-trips through `oid` in `pg_locks`.
const SWEEP_LOCK_CLASS: i32 = 0x70_66_64_73;

/// Domain separator mixed into writer lock keys so they can never
/// collide with other advisory-lock users hashing similar inputs.
const WRITER_LOCK_TAG: u8 = 0x57;

/// 64-bit advisory lock key for a shard's writer lock.
///
/// FNV rather than the stdlib hasher: every process must derive the
/// same key for the same shard, and `DefaultHasher` is randomly seeded.
fn writer_lock_key(feed_id: FeedId, shard_id: ShardId) -> i64 {
    let mut hasher = FnvHasher::default();
    hasher.write(feed_id.as_bytes());
    hasher.write_i32(shard_id);
    hasher.write_u8(WRITER_LOCK_TAG);
    hasher.finish() as i64
}

/// NOTIFY channel carrying a shard's advance signal.
fn signal_channel(feed_id: FeedId, shard_id: ShardId) -> String {
    format!("pgfeed_{}_{}", feed_id.simple(), shard_id)
}

/// `55P03 lock_not_available`: the statement hit `lock_timeout`.
fn is_lock_timeout(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("55P03"))
}

/// Shard state read by a writer after its lock is granted, plus the
/// lock-time stamp.
async fn load_shard_for_writer(
    conn: &mut PoolConnection<Postgres>,
    feed_id: FeedId,
    shard_id: ShardId,
) -> FeedResult<ShardRow> {
    let row = sqlx::query_as::<_, ShardRow>(
        "SELECT last_sequence_number, ulid_prefix, ulid_suffix, \
                last_sweep_time_ms, longpoll \
         FROM changefeed.shard WHERE feed_id = $1 AND shard_id = $2",
    )
    .bind(feed_id)
    .bind(shard_id)
    .fetch_one(&mut **conn)
    .await?;
    sqlx::query(
        "UPDATE changefeed.shard SET last_lock_time_ms = $3 \
         WHERE feed_id = $1 AND shard_id = $2",
    )
    .bind(feed_id)
    .bind(shard_id)
    .bind(unix_millis())
    .execute(&mut **conn)
    .await?;
    Ok(row)
}

/// Durable changefeed store backed by Postgres.
///
/// Connect with [`PostgresStore::connect`]; everything else goes
/// through the [`ChangefeedStore`] trait.
pub struct PostgresStore {
    pool: PgPool,
    config: StoreConfig,
}

/// Row shape for `changefeed.shard` coordination state.
#[derive(Debug, Clone, FromRow)]
struct ShardRow {
    last_sequence_number: i64,
    ulid_prefix: i64,
    ulid_suffix: i64,
    last_sweep_time_ms: i64,
    longpoll: bool,
}

/// Row shape for `changefeed.feed` behavior toggles.
#[derive(Debug, Clone, FromRow)]
struct FeedRow {
    outbox: bool,
    longpoll: bool,
    sweep_group: Option<i32>,
}

/// Unswept change row as pulled by a sweep batch.
#[derive(Debug, Clone, FromRow)]
struct UnsweptRow {
    change_id: i64,
    feed_id: Uuid,
    shard_id: i32,
    time_hint_ms: i64,
}

/// Assigned change row as returned to readers.
#[derive(Debug, Clone, FromRow)]
struct ChangeRow {
    change_id: i64,
    ulid: Vec<u8>,
    change_sequence_number: Option<i64>,
    payload: serde_json::Value,
}

/// Current holder of a writer lock, as seen through
/// `pg_locks`/`pg_stat_activity`.
#[derive(Debug, Clone, FromRow)]
struct HolderRow {
    pid: i32,
    state: Option<String>,
    stalled_ms: Option<i64>,
}

impl PostgresStore {
    /// Connect to Postgres and run embedded migrations.
    ///
    /// Migrations run before the store is handed out so every method
    /// can assume the schema exists; a migration failure fails startup
    /// instead of producing a partially functional store.
    pub async fn connect(pg: &PostgresConfig, config: StoreConfig) -> FeedResult<Self> {
        Self::connect_internal(pg, config, true).await
    }

    /// Connect without running migrations. For tests that manage the
    /// schema externally.
    #[cfg(any(test, feature = "pg-tests"))]
    pub async fn connect_without_migrations(
        pg: &PostgresConfig,
        config: StoreConfig,
    ) -> FeedResult<Self> {
        Self::connect_internal(pg, config, false).await
    }

    async fn connect_internal(
        pg: &PostgresConfig,
        config: StoreConfig,
        run_migrations: bool,
    ) -> FeedResult<Self> {
        // `max_connections` bounds concurrent writers plus sweep loops;
        // `acquire_timeout` makes a saturated pool fail fast instead of
        // queueing forever behind stuck holders.
        let connect_options = PgConnectOptions::from_str(&pg.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(pg.max_connections)
            .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
            .connect_with(connect_options)
            .await?;

        if run_migrations {
            sqlx::migrate!("./migrations").run(&pool).await?;
        }

        Ok(Self { pool, config })
    }

    /// Underlying pool, for callers that share it (health endpoints,
    /// harness cleanup).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn feed_options(&self, feed_id: FeedId) -> FeedResult<FeedOptions> {
        let row = sqlx::query_as::<_, FeedRow>(
            "SELECT outbox, longpoll, sweep_group FROM changefeed.feed WHERE feed_id = $1",
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => FeedOptions {
                outbox: row.outbox,
                longpoll: row.longpoll,
                sweep_group: row.sweep_group,
            },
            None => FeedOptions::default(),
        })
    }
}

/// One writer-lock acquisition attempt on the connection that will host
/// the writer transaction.
///
/// Each attempt opens a transaction, bounds the advisory-lock wait with
/// `lock_timeout`, and on `55P03` rolls back and inspects the holder.
/// A holder sitting idle-in-transaction past the stall threshold is
/// terminated and counted as an incident; any other outcome is plain
/// contention. After `Acquired`, the connection is left inside the open
/// transaction with the lock held.
struct PgLockPort {
    conn: PoolConnection<Postgres>,
    key: i64,
    feed_id: FeedId,
    shard_id: ShardId,
    timeout: Duration,
    stall_threshold: Duration,
}

impl PgLockPort {
    async fn judge_holder(&mut self) -> FeedResult<LockAttempt> {
        // pg_advisory_xact_lock(bigint) stores the key split across
        // classid (high 32 bits) and objid (low 32), with objsubid 1.
        let holder = sqlx::query_as::<_, HolderRow>(
            "SELECT a.pid, a.state, \
                    (extract(epoch FROM (now() - a.state_change)) * 1000)::bigint AS stalled_ms \
             FROM pg_locks l \
             JOIN pg_stat_activity a ON a.pid = l.pid \
             WHERE l.locktype = 'advisory' AND l.objsubid = 1 AND l.granted \
               AND l.classid = (($1::bigint >> 32) & 4294967295)::oid \
               AND l.objid = ($1::bigint & 4294967295)::oid",
        )
        .bind(self.key)
        .fetch_optional(&mut *self.conn)
        .await?;
        let Some(holder) = holder else {
            // Released between our timeout and this query.
            return Ok(LockAttempt::Contended);
        };
        let stalled_ms = holder.stalled_ms.unwrap_or(0);
        let idle_in_transaction = holder.state.as_deref() == Some("idle in transaction");
        if !idle_in_transaction || stalled_ms < self.stall_threshold.as_millis() as i64 {
            // Alive and progressing (or not yet provably stuck).
            return Ok(LockAttempt::Contended);
        }
        let terminated: bool = sqlx::query_scalar("SELECT pg_terminate_backend($1)")
            .bind(holder.pid)
            .fetch_one(&mut *self.conn)
            .await?;
        if !terminated {
            // It exited on its own; the lock is now free to contest.
            return Ok(LockAttempt::Contended);
        }
        let incident_count: i64 = sqlx::query_scalar(
            "INSERT INTO changefeed.incident (feed_id, shard_id, incident_count) \
             VALUES ($1, $2, 1) \
             ON CONFLICT (feed_id, shard_id) DO UPDATE \
             SET incident_count = changefeed.incident.incident_count + 1 \
             RETURNING incident_count",
        )
        .bind(self.feed_id)
        .bind(self.shard_id)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(LockAttempt::Incident { incident_count })
    }
}

#[async_trait]
impl LockAttemptPort for PgLockPort {
    async fn attempt(&mut self, _attempt_no: u32) -> FeedResult<LockAttempt> {
        // READ COMMITTED on purpose: the shard-state read that follows
        // acquisition must see the previous holder's commit, and a
        // REPEATABLE READ snapshot would be pinned before the lock wait
        // finished.
        (&mut *self.conn).execute(sqlx::raw_sql("BEGIN")).await?;
        let timeout_ms = self.timeout.as_millis().max(1);
        if let Err(err) = (&mut *self.conn)
            .execute(sqlx::raw_sql(&format!("SET LOCAL lock_timeout = {timeout_ms}")))
            .await
        {
            let _ = (&mut *self.conn).execute(sqlx::raw_sql("ROLLBACK")).await;
            return Err(err.into());
        }
        let acquired = sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(self.key)
            .execute(&mut *self.conn)
            .await;
        match acquired {
            Ok(_) => {
                // Writer statements must not inherit the short wait.
                if let Err(err) = (&mut *self.conn)
                    .execute(sqlx::raw_sql("SET LOCAL lock_timeout = DEFAULT"))
                    .await
                {
                    let _ = (&mut *self.conn).execute(sqlx::raw_sql("ROLLBACK")).await;
                    return Err(err.into());
                }
                Ok(LockAttempt::Acquired)
            }
            Err(err) if is_lock_timeout(&err) => {
                // 55P03 aborts the transaction; clear it before the
                // holder inspection runs on this connection.
                (&mut *self.conn).execute(sqlx::raw_sql("ROLLBACK")).await?;
                self.judge_holder().await
            }
            Err(err) => {
                let _ = (&mut *self.conn).execute(sqlx::raw_sql("ROLLBACK")).await;
                Err(err.into())
            }
        }
    }
}

/// A writer transaction: one pooled connection inside an open Postgres
/// transaction, holding the shard's advisory lock until commit or
/// rollback.
struct PostgresTransaction {
    conn: Option<PoolConnection<Postgres>>,
    feed_id: FeedId,
    shard_id: ShardId,
    ulid: UlidState,
    time_ms: i64,
    /// `last_sequence_number` as read at begin; rows are assigned
    /// `base_sequence + 1 ..` and commit advances the counter past them.
    base_sequence: i64,
    inserted: i64,
    longpoll: bool,
}

impl PostgresTransaction {
    fn conn(&mut self) -> FeedResult<&mut PoolConnection<Postgres>> {
        self.conn
            .as_mut()
            .ok_or_else(|| FeedError::Integrity("transaction already finished".into()))
    }

    async fn commit_on(&self, conn: &mut PoolConnection<Postgres>) -> FeedResult<()> {
        // The suffix already sits one past the last key handed out,
        // which is exactly what the next transaction must resume from.
        let (ulid_prefix, ulid_suffix) = self.ulid.to_persisted();
        let new_last = self.base_sequence + self.inserted;
        let updated = sqlx::query(
            "UPDATE changefeed.shard \
             SET ulid_prefix = $3, ulid_suffix = $4, last_sequence_number = $5 \
             WHERE feed_id = $1 AND shard_id = $2 AND last_sequence_number = $6",
        )
        .bind(self.feed_id)
        .bind(self.shard_id)
        .bind(ulid_prefix)
        .bind(ulid_suffix)
        .bind(new_last)
        .bind(self.base_sequence)
        .execute(&mut **conn)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(FeedError::Integrity(format!(
                "shard {}/{} advanced while its writer lock was held",
                self.feed_id, self.shard_id
            )));
        }
        if self.longpoll && self.inserted > 0 {
            // Inside the transaction: NOTIFY delivery is commit-atomic,
            // so a waiter woken by it will see the rows.
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(signal_channel(self.feed_id, self.shard_id))
                .bind(new_last.to_string())
                .execute(&mut **conn)
                .await?;
        }
        (&mut **conn).execute(sqlx::raw_sql("COMMIT")).await?;
        Ok(())
    }
}

#[async_trait]
impl FeedTransaction for PostgresTransaction {
    fn feed_id(&self) -> FeedId {
        self.feed_id
    }

    fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    fn time_ms(&self) -> i64 {
        self.time_ms
    }

    fn next_ulid(&mut self) -> ChangeUlid {
        self.ulid.next()
    }

    async fn insert_change(&mut self, payload: serde_json::Value) -> FeedResult<ChangeUlid> {
        let key = self.ulid.next();
        let sequence_number = self.base_sequence + self.inserted + 1;
        let feed_id = self.feed_id;
        let shard_id = self.shard_id;
        let time_ms = self.time_ms;
        let conn = self.conn()?;
        sqlx::query(
            "INSERT INTO changefeed.change \
               (feed_id, shard_id, time_hint_ms, payload, ulid, change_sequence_number) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(feed_id)
        .bind(shard_id)
        .bind(time_ms)
        .bind(payload)
        .bind(&key.0[..])
        .bind(sequence_number)
        .execute(&mut **conn)
        .await?;
        self.inserted += 1;
        Ok(key)
    }

    async fn commit(mut self: Box<Self>) -> FeedResult<()> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| FeedError::Integrity("transaction already finished".into()))?;
        let result = self.commit_on(&mut conn).await;
        if result.is_err() {
            // Whatever failed, the connection must not return to the
            // pool inside the open transaction holding the shard lock.
            let _ = (&mut *conn).execute(sqlx::raw_sql("ROLLBACK")).await;
        }
        result
    }

    async fn rollback(mut self: Box<Self>) -> FeedResult<()> {
        // The reserved suffix range is abandoned: gaps, never
        // duplicates. Nothing was visible to readers.
        if let Some(mut conn) = self.conn.take() {
            (&mut *conn).execute(sqlx::raw_sql("ROLLBACK")).await?;
        }
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        // Dropping unfinished behaves as rollback; the advisory lock
        // releases with the transaction.
        if let Some(mut conn) = self.conn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = (&mut *conn).execute(sqlx::raw_sql("ROLLBACK")).await;
                    });
                }
                Err(_) => {
                    // No runtime to roll back on: close the connection
                    // outright so the pool never re-serves a session
                    // stuck inside this transaction. The server aborts
                    // the transaction when the socket drops.
                    drop(conn.detach());
                }
            }
        }
    }
}

/// Session advisory lock on a dedicated pooled connection. The lock
/// lives as long as the session, so the guard keeps the connection out
/// of the pool until released.
struct PostgresSweepGuard {
    group: SweepGroup,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl SweepGuard for PostgresSweepGuard {
    async fn release(mut self: Box<Self>) -> FeedResult<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                .bind(SWEEP_LOCK_CLASS)
                .bind(self.group)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

impl Drop for PostgresSweepGuard {
    fn drop(&mut self) {
        // The pool reuses released connections without discarding
        // session state, so an unlock must run before this connection
        // goes back.
        if let Some(mut conn) = self.conn.take() {
            let group = self.group;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                            .bind(SWEEP_LOCK_CLASS)
                            .bind(group)
                            .execute(&mut *conn)
                            .await;
                    });
                }
                Err(_) => {
                    // No runtime: closing the session releases its
                    // advisory locks server-side.
                    drop(conn.detach());
                }
            }
        }
    }
}

#[async_trait]
impl ChangefeedStore for PostgresStore {
    async fn ensure_feed(&self, feed_id: FeedId, options: FeedOptions) -> FeedResult<()> {
        sqlx::query(
            "INSERT INTO changefeed.feed (feed_id, outbox, longpoll, sweep_group) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (feed_id) DO NOTHING",
        )
        .bind(feed_id)
        .bind(options.outbox)
        .bind(options.longpoll)
        .bind(options.sweep_group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_shard(&self, feed_id: FeedId, shard_id: ShardId) -> FeedResult<()> {
        let options = self.feed_options(feed_id).await?;
        sqlx::query(
            "INSERT INTO changefeed.shard \
               (feed_id, shard_id, last_sequence_number, ulid_prefix, ulid_suffix, \
                last_sweep_time_ms, last_lock_time_ms, sweep_group, longpoll) \
             VALUES ($1, $2, $3, 0, 0, $4, 0, $5, $6) \
             ON CONFLICT (feed_id, shard_id) DO NOTHING",
        )
        .bind(feed_id)
        .bind(shard_id)
        .bind(SEQUENCE_BASE)
        .bind(unix_millis())
        .bind(options.sweep_group)
        .bind(options.longpoll)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn begin(
        &self,
        feed_id: FeedId,
        shard_id: ShardId,
        options: TransactionOptions,
    ) -> FeedResult<Box<dyn FeedTransaction>> {
        self.ensure_shard(feed_id, shard_id).await?;
        let policy = LockPolicy {
            timeout: self.config.lock_timeout,
            max_attempts: self.config.incident_max_attempts,
            stall_threshold: self.config.incident_stall_threshold,
        };
        let mut port = PgLockPort {
            conn: self.pool.acquire().await?,
            key: writer_lock_key(feed_id, shard_id),
            feed_id,
            shard_id,
            timeout: policy.timeout,
            stall_threshold: policy.stall_threshold,
        };
        acquire_with_recovery(&policy, feed_id, shard_id, &mut port).await?;
        let mut conn = port.conn;

        // Lock held, transaction open: this read sees the previous
        // holder's committed state. A failure here must end the
        // transaction before the connection goes back to the pool.
        let row = match load_shard_for_writer(&mut conn, feed_id, shard_id).await {
            Ok(row) => row,
            Err(err) => {
                let _ = (&mut *conn).execute(sqlx::raw_sql("ROLLBACK")).await;
                return Err(err);
            }
        };

        let time_hint_ms = options.time_hint_ms.unwrap_or_else(unix_millis);
        let mut ulid = UlidState::from_persisted(row.ulid_prefix, row.ulid_suffix);
        ulid.advance_to(time_hint_ms);

        Ok(Box::new(PostgresTransaction {
            conn: Some(conn),
            feed_id,
            shard_id,
            time_ms: ulid.timestamp_ms(),
            ulid,
            base_sequence: row.last_sequence_number,
            inserted: 0,
            longpoll: row.longpoll,
        }))
    }

    async fn insert_outbox(
        &self,
        feed_id: FeedId,
        shard_id: ShardId,
        time_hint_ms: Option<i64>,
        payload: serde_json::Value,
    ) -> FeedResult<i64> {
        self.ensure_shard(feed_id, shard_id).await?;
        let change_id: i64 = sqlx::query_scalar(
            "INSERT INTO changefeed.change (feed_id, shard_id, time_hint_ms, payload) \
             VALUES ($1, $2, $3, $4) \
             RETURNING change_id",
        )
        .bind(feed_id)
        .bind(shard_id)
        .bind(time_hint_ms.unwrap_or_else(unix_millis))
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(change_id)
    }

    async fn lock_sweep_group(
        &self,
        group: SweepGroup,
        wait: Duration,
    ) -> FeedResult<Option<Box<dyn SweepGuard>>> {
        let mut conn = self.pool.acquire().await?;
        let wait_ms = wait.as_millis();
        if wait_ms == 0 {
            // lock_timeout 0 means "wait forever" in Postgres, so a
            // zero wait maps to the non-blocking form instead.
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
                .bind(SWEEP_LOCK_CLASS)
                .bind(group)
                .fetch_one(&mut *conn)
                .await?;
            if !acquired {
                return Ok(None);
            }
        } else {
            // SET LOCAL scopes the short wait to this transaction, so
            // the pooled session never carries it back. The session
            // advisory lock itself is untouched by the commit.
            let mut txn = conn.begin().await?;
            (&mut *txn)
                .execute(sqlx::raw_sql(&format!("SET LOCAL lock_timeout = {wait_ms}")))
                .await?;
            let acquired = sqlx::query("SELECT pg_advisory_lock($1, $2)")
                .bind(SWEEP_LOCK_CLASS)
                .bind(group)
                .execute(&mut *txn)
                .await;
            match acquired {
                Ok(_) => txn.commit().await?,
                Err(err) if is_lock_timeout(&err) => {
                    txn.rollback().await?;
                    return Ok(None);
                }
                Err(err) => {
                    txn.rollback().await?;
                    return Err(err.into());
                }
            }
        }
        tracing::debug!(group, "sweep group lock acquired");
        Ok(Some(Box::new(PostgresSweepGuard {
            group,
            conn: Some(conn),
        })))
    }

    async fn sweep_once(&self, group: SweepGroup) -> FeedResult<Vec<ShardSweepStats>> {
        // sqlx transaction: any `?`-propagated error drops the handle
        // and the connection rolls back before returning to the pool.
        let mut txn = self.pool.begin().await?;
        let batch = sqlx::query_as::<_, UnsweptRow>(
            "SELECT c.change_id, c.feed_id, c.shard_id, c.time_hint_ms \
             FROM changefeed.change c \
             JOIN changefeed.shard s \
               ON s.feed_id = c.feed_id AND s.shard_id = c.shard_id \
             WHERE s.sweep_group = $1 AND c.change_sequence_number IS NULL \
             ORDER BY c.change_id \
             LIMIT $2",
        )
        .bind(group)
        .bind(self.config.sweep_batch_size as i64)
        .fetch_all(&mut *txn)
        .await?;
        if batch.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        // Group per shard, keeping each shard's rows in change_id
        // order.
        let mut shard_order: Vec<(FeedId, ShardId)> = Vec::new();
        let mut grouped: HashMap<(FeedId, ShardId), Vec<UnsweptRow>> = HashMap::new();
        for row in batch {
            let key = (row.feed_id, row.shard_id);
            if !grouped.contains_key(&key) {
                shard_order.push(key);
            }
            grouped.entry(key).or_default().push(row);
        }

        let now = unix_millis();
        let mut stats = Vec::with_capacity(shard_order.len());
        let mut wakeups: Vec<(String, i64)> = Vec::new();
        for (feed_id, shard_id) in shard_order {
            let rows = &grouped[&(feed_id, shard_id)];
            let shard = sqlx::query_as::<_, ShardRow>(
                "SELECT last_sequence_number, ulid_prefix, ulid_suffix, \
                        last_sweep_time_ms, longpoll \
                 FROM changefeed.shard WHERE feed_id = $1 AND shard_id = $2",
            )
            .bind(feed_id)
            .bind(shard_id)
            .fetch_one(&mut *txn)
            .await?;

            let mut ulid = UlidState::from_persisted(shard.ulid_prefix, shard.ulid_suffix);
            let mut sequence_number = shard.last_sequence_number;
            let mut change_ids = Vec::with_capacity(rows.len());
            let mut sequence_numbers = Vec::with_capacity(rows.len());
            let mut keys: Vec<Vec<u8>> = Vec::with_capacity(rows.len());
            for row in rows {
                ulid.advance_to(row.time_hint_ms);
                sequence_number += 1;
                change_ids.push(row.change_id);
                sequence_numbers.push(sequence_number);
                keys.push(ulid.next().0.to_vec());
            }

            // Conditional write-back is the race check: if another
            // sweeper advanced this shard since our read, zero rows
            // match and the whole batch rolls back.
            let (ulid_prefix, ulid_suffix) = ulid.to_persisted();
            let updated = sqlx::query(
                "UPDATE changefeed.shard \
                 SET last_sequence_number = $3, ulid_prefix = $4, ulid_suffix = $5, \
                     last_sweep_time_ms = $6 \
                 WHERE feed_id = $1 AND shard_id = $2 AND last_sequence_number = $7",
            )
            .bind(feed_id)
            .bind(shard_id)
            .bind(sequence_number)
            .bind(ulid_prefix)
            .bind(ulid_suffix)
            .bind(now)
            .bind(shard.last_sequence_number)
            .execute(&mut *txn)
            .await?;
            if updated.rows_affected() != 1 {
                txn.rollback().await?;
                return Err(FeedError::Race {
                    group,
                    expected: 1,
                    actual: updated.rows_affected(),
                });
            }

            let expected = change_ids.len() as u64;
            let assigned = sqlx::query(
                "UPDATE changefeed.change AS c \
                 SET change_sequence_number = a.seq, ulid = a.ulid \
                 FROM (SELECT unnest($1::bigint[]) AS change_id, \
                              unnest($2::bigint[]) AS seq, \
                              unnest($3::bytea[]) AS ulid) AS a \
                 WHERE c.change_id = a.change_id AND c.change_sequence_number IS NULL",
            )
            .bind(change_ids)
            .bind(sequence_numbers)
            .bind(keys)
            .execute(&mut *txn)
            .await?;
            if assigned.rows_affected() != expected {
                txn.rollback().await?;
                return Err(FeedError::Race {
                    group,
                    expected,
                    actual: assigned.rows_affected(),
                });
            }

            stats.push(ShardSweepStats {
                feed_id,
                shard_id,
                changes_assigned: expected as i64,
                last_sequence_number_before: shard.last_sequence_number,
                lag_milliseconds: (now - shard.last_sweep_time_ms).max(0),
            });
            if shard.longpoll {
                wakeups.push((signal_channel(feed_id, shard_id), sequence_number));
            }
        }

        // Inside the transaction, so waiters wake only once the rows
        // are visible.
        for (channel, sequence_number) in wakeups {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(channel)
                .bind(sequence_number.to_string())
                .execute(&mut *txn)
                .await?;
        }
        txn.commit().await?;
        Ok(stats)
    }

    async fn last_sequence_number(&self, feed_id: FeedId, shard_id: ShardId) -> FeedResult<i64> {
        let sequence_number: Option<i64> = sqlx::query_scalar(
            "SELECT last_sequence_number FROM changefeed.shard \
             WHERE feed_id = $1 AND shard_id = $2",
        )
        .bind(feed_id)
        .bind(shard_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sequence_number.unwrap_or(SEQUENCE_BASE))
    }

    async fn wait_for_signal(
        &self,
        feed_id: FeedId,
        shard_id: ShardId,
        seen_sequence_number: i64,
        timeout: Duration,
    ) -> FeedResult<SignalOutcome> {
        // Register the listener first, then re-poll: an advance that
        // commits between the two is caught by the poll, one that
        // commits after is caught by the notification.
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&signal_channel(feed_id, shard_id)).await?;

        if self.last_sequence_number(feed_id, shard_id).await? != seen_sequence_number {
            return Ok(SignalOutcome::Signaled);
        }

        // Blocking shards (sweep_group NULL) are advanced by writers,
        // not sweepers, so the no-sweeper check does not apply.
        let sweep_group: Option<Option<i32>> = sqlx::query_scalar(
            "SELECT sweep_group FROM changefeed.shard WHERE feed_id = $1 AND shard_id = $2",
        )
        .bind(feed_id)
        .bind(shard_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(Some(group)) = sweep_group {
            let holders: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM pg_locks \
                 WHERE locktype = 'advisory' AND objsubid = 2 AND granted \
                   AND classid = $1::oid AND objid = $2::oid",
            )
            .bind(SWEEP_LOCK_CLASS)
            .bind(group)
            .fetch_one(&self.pool)
            .await?;
            if holders == 0 {
                return Ok(SignalOutcome::NoSweeper);
            }
        }

        match tokio::time::timeout(timeout, listener.recv()).await {
            Ok(Ok(_)) => Ok(SignalOutcome::Signaled),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Ok(SignalOutcome::TimedOut),
        }
    }

    async fn read_feed(
        &self,
        feed_id: FeedId,
        shard_id: ShardId,
        cursor: Cursor,
        page_size: Option<usize>,
    ) -> FeedResult<FeedPage> {
        let limit = self.config.clamp_page_size(page_size) as i64;
        let rows = sqlx::query_as::<_, ChangeRow>(
            "SELECT change_id, ulid, change_sequence_number, payload \
             FROM changefeed.change \
             WHERE feed_id = $1 AND shard_id = $2 \
               AND ulid IS NOT NULL AND ulid > $3 \
             ORDER BY ulid \
             LIMIT $4",
        )
        .bind(feed_id)
        .bind(shard_id)
        .bind(&cursor.as_bytes()[..])
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let bytes: [u8; 16] = row.ulid.as_slice().try_into().map_err(|_| {
                FeedError::Integrity(format!(
                    "change {} carries a key of {} bytes, want 16",
                    row.change_id,
                    row.ulid.len()
                ))
            })?;
            events.push(FeedEvent {
                ulid: ChangeUlid::from_bytes(bytes),
                change_id: row.change_id,
                sequence_number: row.change_sequence_number,
                payload: row.payload,
            });
        }
        let next_cursor = events.last().map(|e| Cursor::from(e.ulid)).unwrap_or(cursor);
        Ok(FeedPage {
            events,
            next_cursor,
        })
    }

    async fn incident_count(&self, feed_id: FeedId, shard_id: ShardId) -> FeedResult<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT incident_count FROM changefeed.incident \
             WHERE feed_id = $1 AND shard_id = $2",
        )
        .bind(feed_id)
        .bind(shard_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    async fn health_check(&self) -> FeedResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
