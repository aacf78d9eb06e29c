//! In-memory implementation of the changefeed store.
//!
//! # Purpose
//! Implements [`ChangefeedStore`] entirely in process, with tokio sync
//! primitives standing in for the substrate's advisory locks and an
//! atomic counter standing in for the `change_id` sequence object. It
//! exists for local development and tests: the whole coordination
//! protocol (sweep batches with the conditional-count race check,
//! writer locks with incident burn, the poll-block-poll longpoll) runs
//! here with the same observable semantics as the Postgres backend.
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost on process restart.
//! - Single-process only; "crashed holder" is simulated through the
//!   [`MemoryStore::leak_writer_lock`] test hook, which parks a holder
//!   that will never release, exactly what an abandoned session looks
//!   like from the outside.
//!
//! # Concurrency model
//! Authoritative maps sit behind `tokio::sync::RwLock` (lock order:
//! shards before changes). The small bookkeeping tables (lock holders,
//! signals, sweeper sessions, incident counters) use `parking_lot`
//! mutexes and are never held across an await.
use super::{
    ChangefeedStore, FeedError, FeedResult, FeedTransaction, LockAttempt, StoreConfig, SweepGuard,
};
use crate::cursor::Cursor;
use crate::lock::{acquire_with_recovery, LockAttemptPort, LockPolicy};
use crate::model::{
    unix_millis, FeedEvent, FeedId, FeedOptions, FeedPage, ShardId, ShardSweepStats, SignalOutcome,
    SweepGroup, TransactionOptions, SEQUENCE_BASE,
};
use crate::ulid::{ChangeUlid, UlidState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedMutexGuard, RwLock};
use tokio::time::Instant;

type ShardKey = (FeedId, ShardId);

#[derive(Debug, Clone)]
struct ShardState {
    last_sequence_number: i64,
    ulid: UlidState,
    last_sweep_time_ms: i64,
    last_lock_time_ms: i64,
    sweep_group: Option<SweepGroup>,
    longpoll: bool,
}

#[derive(Debug, Clone)]
struct ChangeRow {
    change_id: i64,
    feed_id: FeedId,
    shard_id: ShardId,
    time_hint_ms: i64,
    payload: serde_json::Value,
    ulid: Option<ChangeUlid>,
    sequence_number: Option<i64>,
}

/// One registered writer-lock holder.
struct Holder {
    session: u64,
    alive: Arc<AtomicBool>,
    since_ms: i64,
}

/// Advisory-lock stand-in for the per-shard exclusive writer lock.
///
/// Sync throughout (holders behind a `parking_lot` mutex, wakeups via
/// `Notify`) so a dropped transaction handle can release from `Drop`.
#[derive(Default)]
struct WriterLockTable {
    holders: Mutex<HashMap<ShardKey, Holder>>,
    notifiers: Mutex<HashMap<ShardKey, Arc<Notify>>>,
    next_session: AtomicU64,
}

impl WriterLockTable {
    fn notifier(&self, key: ShardKey) -> Arc<Notify> {
        Arc::clone(self.notifiers.lock().entry(key).or_default())
    }

    /// Try to take the lock, waiting at most `timeout`. Returns the
    /// session id on success.
    async fn acquire(
        &self,
        key: ShardKey,
        timeout: Duration,
        alive: Arc<AtomicBool>,
    ) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = self.notifier(key);
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before re-checking the holder so a
            // release between the check and the wait cannot be missed.
            notified.as_mut().enable();
            {
                let mut holders = self.holders.lock();
                if !holders.contains_key(&key) {
                    let session = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
                    holders.insert(
                        key,
                        Holder {
                            session,
                            alive,
                            since_ms: unix_millis(),
                        },
                    );
                    return Some(session);
                }
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Snapshot of the current holder: (session, alive, held-for ms).
    fn inspect(&self, key: ShardKey) -> Option<(u64, bool, i64)> {
        self.holders.lock().get(&key).map(|h| {
            (
                h.session,
                h.alive.load(Ordering::SeqCst),
                unix_millis() - h.since_ms,
            )
        })
    }

    /// Force-release a specific holder (incident recovery). Comparing
    /// the session guards against burning a successor that acquired
    /// the lock in the meantime.
    fn burn(&self, key: ShardKey, session: u64) -> bool {
        let removed = {
            let mut holders = self.holders.lock();
            match holders.get(&key) {
                Some(h) if h.session == session => {
                    holders.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.notifier(key).notify_waiters();
        }
        removed
    }

    fn release(&self, key: ShardKey, session: u64) {
        self.burn(key, session);
    }
}

struct ShardSignal {
    notify: Notify,
}

struct Inner {
    config: StoreConfig,
    feeds: RwLock<HashMap<FeedId, FeedOptions>>,
    shards: RwLock<HashMap<ShardKey, ShardState>>,
    changes: RwLock<Vec<ChangeRow>>,
    next_change_id: AtomicI64,
    writer_locks: WriterLockTable,
    sweep_locks: Mutex<HashMap<SweepGroup, Arc<tokio::sync::Mutex<()>>>>,
    sweeper_sessions: Mutex<HashMap<SweepGroup, usize>>,
    signals: Mutex<HashMap<ShardKey, Arc<ShardSignal>>>,
    incidents: Mutex<HashMap<ShardKey, i64>>,
}

impl Inner {
    fn signal(&self, key: ShardKey) -> Arc<ShardSignal> {
        Arc::clone(
            self.signals
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(ShardSignal {
                    notify: Notify::new(),
                })),
        )
    }

    fn bump_incident(&self, key: ShardKey) -> i64 {
        let mut incidents = self.incidents.lock();
        let count = incidents.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            timeout: self.config.lock_timeout,
            max_attempts: self.config.incident_max_attempts,
            stall_threshold: self.config.incident_stall_threshold,
        }
    }
}

/// In-memory changefeed store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                feeds: RwLock::new(HashMap::new()),
                shards: RwLock::new(HashMap::new()),
                changes: RwLock::new(Vec::new()),
                next_change_id: AtomicI64::new(1),
                writer_locks: WriterLockTable::default(),
                sweep_locks: Mutex::new(HashMap::new()),
                sweeper_sessions: Mutex::new(HashMap::new()),
                signals: Mutex::new(HashMap::new()),
                incidents: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Test hook: park a holder on the shard's writer lock that will
    /// never release, simulating a client that crashed mid-transaction.
    /// The next acquirer times out, detects the dead holder, burns it,
    /// and bumps the incident counter.
    pub async fn leak_writer_lock(&self, feed_id: FeedId, shard_id: ShardId) -> FeedResult<()> {
        let key = (feed_id, shard_id);
        let dead = Arc::new(AtomicBool::new(false));
        let session = self
            .inner
            .writer_locks
            .acquire(key, self.inner.config.lock_timeout, dead)
            .await;
        match session {
            Some(_) => Ok(()),
            None => Err(FeedError::Integrity(format!(
                "cannot leak writer lock for feed {feed_id} shard {shard_id}: already held"
            ))),
        }
    }

    async fn shard_state(&self, key: ShardKey) -> FeedResult<ShardState> {
        self.inner
            .shards
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| FeedError::NotFound(format!("shard {}/{}", key.0, key.1)))
    }
}

struct MemorySweepGuard {
    inner: Arc<Inner>,
    group: SweepGroup,
    guard: Option<OwnedMutexGuard<()>>,
}

impl MemorySweepGuard {
    fn unregister(&mut self) {
        if self.guard.take().is_some() {
            let mut sessions = self.inner.sweeper_sessions.lock();
            if let Some(n) = sessions.get_mut(&self.group) {
                *n = n.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl SweepGuard for MemorySweepGuard {
    async fn release(mut self: Box<Self>) -> FeedResult<()> {
        self.unregister();
        Ok(())
    }
}

impl Drop for MemorySweepGuard {
    fn drop(&mut self) {
        self.unregister();
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    key: ShardKey,
    session: u64,
    ulid: UlidState,
    time_ms: i64,
    staged: Vec<(ChangeUlid, i64, serde_json::Value)>,
    finished: bool,
}

impl MemoryTransaction {
    fn release_lock(&mut self) {
        if !self.finished {
            self.inner.writer_locks.release(self.key, self.session);
            self.finished = true;
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        // Dropping an unfinished handle behaves as rollback: staged
        // rows are discarded and the lock released.
        self.release_lock();
    }
}

#[async_trait]
impl FeedTransaction for MemoryTransaction {
    fn feed_id(&self) -> FeedId {
        self.key.0
    }

    fn shard_id(&self) -> ShardId {
        self.key.1
    }

    fn time_ms(&self) -> i64 {
        self.time_ms
    }

    fn next_ulid(&mut self) -> ChangeUlid {
        self.ulid.next()
    }

    async fn insert_change(&mut self, payload: serde_json::Value) -> FeedResult<ChangeUlid> {
        let ulid = self.ulid.next();
        self.staged.push((ulid, self.time_ms, payload));
        Ok(ulid)
    }

    async fn commit(mut self: Box<Self>) -> FeedResult<()> {
        let staged = std::mem::take(&mut self.staged);
        let mut notify_longpoll = false;
        {
            let mut shards = self.inner.shards.write().await;
            let mut changes = self.inner.changes.write().await;
            let shard = shards.get_mut(&self.key).ok_or_else(|| {
                FeedError::Integrity(format!(
                    "shard {}/{} vanished under an open transaction",
                    self.key.0, self.key.1
                ))
            })?;
            for (i, (ulid, hint_ms, payload)) in staged.into_iter().enumerate() {
                let change_id = self.inner.next_change_id.fetch_add(1, Ordering::Relaxed);
                changes.push(ChangeRow {
                    change_id,
                    feed_id: self.key.0,
                    shard_id: self.key.1,
                    time_hint_ms: hint_ms,
                    payload,
                    ulid: Some(ulid),
                    sequence_number: Some(shard.last_sequence_number + 1 + i as i64),
                });
                shard.last_sequence_number += 1;
                notify_longpoll = shard.longpoll;
            }
            // `self.ulid.suffix` already sits one past the last key
            // handed out, which is exactly what the next transaction
            // must resume from.
            shard.ulid = self.ulid;
        }
        if notify_longpoll {
            self.inner.signal(self.key).notify.notify_waiters();
        }
        self.release_lock();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> FeedResult<()> {
        // The reserved suffix range is abandoned: gaps, never
        // duplicates. Nothing was visible to readers.
        self.staged.clear();
        self.release_lock();
        Ok(())
    }
}

/// One writer-lock acquisition attempt against the in-process lock
/// table: try with the configured timeout, and on timeout decide
/// between a live holder (contention) and a parked one (incident, which
/// is burned here before reporting).
struct MemoryLockPort {
    inner: Arc<Inner>,
    key: ShardKey,
    alive: Arc<AtomicBool>,
    session: u64,
}

#[async_trait]
impl LockAttemptPort for MemoryLockPort {
    async fn attempt(&mut self, _attempt_no: u32) -> FeedResult<LockAttempt> {
        if let Some(session) = self
            .inner
            .writer_locks
            .acquire(
                self.key,
                self.inner.config.lock_timeout,
                Arc::clone(&self.alive),
            )
            .await
        {
            self.session = session;
            return Ok(LockAttempt::Acquired);
        }
        match self.inner.writer_locks.inspect(self.key) {
            Some((session, false, _)) => {
                if self.inner.writer_locks.burn(self.key, session) {
                    Ok(LockAttempt::Incident {
                        incident_count: self.inner.bump_incident(self.key),
                    })
                } else {
                    // The holder released (or was burned) just as we
                    // looked; plain contention.
                    Ok(LockAttempt::Contended)
                }
            }
            _ => Ok(LockAttempt::Contended),
        }
    }
}

#[async_trait]
impl ChangefeedStore for MemoryStore {
    async fn ensure_feed(&self, feed_id: FeedId, options: FeedOptions) -> FeedResult<()> {
        self.inner
            .feeds
            .write()
            .await
            .entry(feed_id)
            .or_insert(options);
        Ok(())
    }

    async fn ensure_shard(&self, feed_id: FeedId, shard_id: ShardId) -> FeedResult<()> {
        let options = self
            .inner
            .feeds
            .read()
            .await
            .get(&feed_id)
            .copied()
            .unwrap_or_default();
        self.inner
            .shards
            .write()
            .await
            .entry((feed_id, shard_id))
            .or_insert_with(|| ShardState {
                last_sequence_number: SEQUENCE_BASE,
                ulid: UlidState::initial(),
                last_sweep_time_ms: unix_millis(),
                last_lock_time_ms: 0,
                sweep_group: options.sweep_group,
                longpoll: options.longpoll,
            });
        Ok(())
    }

    async fn begin(
        &self,
        feed_id: FeedId,
        shard_id: ShardId,
        options: TransactionOptions,
    ) -> FeedResult<Box<dyn FeedTransaction>> {
        self.ensure_shard(feed_id, shard_id).await?;
        let key = (feed_id, shard_id);
        let policy = self.inner.lock_policy();
        let mut port = MemoryLockPort {
            inner: Arc::clone(&self.inner),
            key,
            alive: Arc::new(AtomicBool::new(true)),
            session: 0,
        };
        acquire_with_recovery(&policy, feed_id, shard_id, &mut port).await?;
        let session = port.session;

        let time_hint_ms = options.time_hint_ms.unwrap_or_else(unix_millis);
        let ulid = {
            let mut shards = self.inner.shards.write().await;
            let shard = shards
                .get_mut(&key)
                .ok_or_else(|| FeedError::NotFound(format!("shard {feed_id}/{shard_id}")))?;
            shard.last_lock_time_ms = unix_millis();
            let mut state = shard.ulid;
            state.advance_to(time_hint_ms);
            state
        };

        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            key,
            session,
            time_ms: ulid.timestamp_ms(),
            ulid,
            staged: Vec::new(),
            finished: false,
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
        let change_id = self.inner.next_change_id.fetch_add(1, Ordering::Relaxed);
        self.inner.changes.write().await.push(ChangeRow {
            change_id,
            feed_id,
            shard_id,
            time_hint_ms: time_hint_ms.unwrap_or_else(unix_millis),
            payload,
            ulid: None,
            sequence_number: None,
        });
        Ok(change_id)
    }

    async fn lock_sweep_group(
        &self,
        group: SweepGroup,
        wait: Duration,
    ) -> FeedResult<Option<Box<dyn SweepGuard>>> {
        let mutex = Arc::clone(self.inner.sweep_locks.lock().entry(group).or_default());
        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => {
                *self.inner.sweeper_sessions.lock().entry(group).or_insert(0) += 1;
                Ok(Some(Box::new(MemorySweepGuard {
                    inner: Arc::clone(&self.inner),
                    group,
                    guard: Some(guard),
                })))
            }
            Err(_) => Ok(None),
        }
    }

    async fn sweep_once(&self, group: SweepGroup) -> FeedResult<Vec<ShardSweepStats>> {
        let now = unix_millis();
        let mut shards = self.inner.shards.write().await;
        let mut changes = self.inner.changes.write().await;

        // Physical insertion order is the only total order available;
        // it must be preserved or per-shard ordering breaks.
        let mut batch: Vec<usize> = Vec::new();
        for (idx, row) in changes.iter().enumerate() {
            if batch.len() >= self.inner.config.sweep_batch_size {
                break;
            }
            if row.sequence_number.is_some() {
                continue;
            }
            let in_group = shards
                .get(&(row.feed_id, row.shard_id))
                .map(|s| s.sweep_group == Some(group))
                .unwrap_or(false);
            if in_group {
                batch.push(idx);
            }
        }

        let mut per_shard: HashMap<ShardKey, Vec<usize>> = HashMap::new();
        let mut order: Vec<ShardKey> = Vec::new();
        for idx in batch {
            let key = (changes[idx].feed_id, changes[idx].shard_id);
            let rows = per_shard.entry(key).or_default();
            if rows.is_empty() {
                order.push(key);
            }
            rows.push(idx);
        }

        let mut stats = Vec::with_capacity(order.len());
        let mut wake: Vec<ShardKey> = Vec::new();
        for key in order {
            let rows = &per_shard[&key];
            let shard = shards
                .get_mut(&key)
                .ok_or_else(|| FeedError::Integrity(format!("shard {}/{} missing", key.0, key.1)))?;
            let before = shard.last_sequence_number;
            // Count-then-assign mirrors the conditional-update check: a
            // row that is no longer null means an overlapping assigner
            // got here first, and the batch must stay untouched.
            let assignable = rows
                .iter()
                .filter(|&&idx| changes[idx].sequence_number.is_none())
                .count() as u64;
            if assignable != rows.len() as u64 {
                return Err(FeedError::Race {
                    group,
                    expected: rows.len() as u64,
                    actual: assignable,
                });
            }
            for (rank, &idx) in rows.iter().enumerate() {
                let row = &mut changes[idx];
                shard.ulid.advance_to(row.time_hint_ms);
                row.ulid = Some(shard.ulid.next());
                row.sequence_number = Some(before + 1 + rank as i64);
            }
            let assigned = rows.len() as u64;
            shard.last_sequence_number = before + assigned as i64;
            let lag = now - shard.last_sweep_time_ms;
            shard.last_sweep_time_ms = now;
            if shard.longpoll {
                wake.push(key);
            }
            stats.push(ShardSweepStats {
                feed_id: key.0,
                shard_id: key.1,
                changes_assigned: assigned as i64,
                last_sequence_number_before: before,
                lag_milliseconds: lag.max(0),
            });
        }
        drop(changes);
        drop(shards);

        for key in wake {
            self.inner.signal(key).notify.notify_waiters();
        }
        Ok(stats)
    }

    async fn last_sequence_number(&self, feed_id: FeedId, shard_id: ShardId) -> FeedResult<i64> {
        Ok(self.shard_state((feed_id, shard_id)).await?.last_sequence_number)
    }

    async fn wait_for_signal(
        &self,
        feed_id: FeedId,
        shard_id: ShardId,
        seen_sequence_number: i64,
        timeout: Duration,
    ) -> FeedResult<SignalOutcome> {
        let key = (feed_id, shard_id);
        let shard = self.shard_state(key).await?;

        let signal = self.inner.signal(key);
        let notified = signal.notify.notified();
        tokio::pin!(notified);
        // Arm the waiter before the re-poll so an advance between the
        // two cannot be missed.
        notified.as_mut().enable();

        if self.shard_state(key).await?.last_sequence_number != seen_sequence_number {
            return Ok(SignalOutcome::Signaled);
        }

        // Blocking feeds (no sweep group) are woken by committing
        // writers; the no-sweeper check only applies to swept shards.
        if let Some(group) = shard.sweep_group {
            let running = self
                .inner
                .sweeper_sessions
                .lock()
                .get(&group)
                .copied()
                .unwrap_or(0);
            if running == 0 {
                return Ok(SignalOutcome::NoSweeper);
            }
        }

        match tokio::time::timeout(timeout, notified).await {
            Ok(()) => Ok(SignalOutcome::Signaled),
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
        let limit = self.inner.config.clamp_page_size(page_size);
        let changes = self.inner.changes.read().await;
        let mut rows: Vec<&ChangeRow> = changes
            .iter()
            .filter(|row| {
                row.feed_id == feed_id
                    && row.shard_id == shard_id
                    && row
                        .ulid
                        .map(|u| Cursor::from(u) > cursor)
                        .unwrap_or(false)
            })
            .collect();
        rows.sort_by_key(|row| row.ulid);
        rows.truncate(limit);

        let events: Vec<FeedEvent> = rows
            .into_iter()
            .filter_map(|row| {
                row.ulid.map(|ulid| FeedEvent {
                    ulid,
                    change_id: row.change_id,
                    sequence_number: row.sequence_number,
                    payload: row.payload.clone(),
                })
            })
            .collect();
        let next_cursor = events
            .last()
            .map(|e| Cursor::from(e.ulid))
            .unwrap_or(cursor);
        Ok(FeedPage {
            events,
            next_cursor,
        })
    }

    async fn incident_count(&self, feed_id: FeedId, shard_id: ShardId) -> FeedResult<i64> {
        Ok(self
            .inner
            .incidents
            .lock()
            .get(&(feed_id, shard_id))
            .copied()
            .unwrap_or(0))
    }

    async fn health_check(&self) -> FeedResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
