//! Storage substrate trait and error taxonomy.
//!
//! # Purpose
//! The coordination protocol (sweep, writer locks, longpoll, cursor
//! reads) is defined against this trait so the same drivers run on both
//! backends: the in-memory store for dev/tests and the Postgres store
//! for production. Each backend maps the substrate primitives (advisory
//! locks, atomic counters, snapshot transactions, a wakeup signal) onto
//! what it actually has.
//!
//! # Error taxonomy
//! Contention is not an error: a lock-acquire timeout means "someone
//! else owns this" and surfaces as an empty result (`None` guard, zero
//! stats). [`FeedError::Race`] is retryable and self-healing.
//! [`FeedError::IncidentBudgetExhausted`] and [`FeedError::Integrity`]
//! are fatal and must reach the operator with enough detail (counts,
//! ids) to diagnose without guessing.
use crate::cursor::Cursor;
use crate::model::{
    FeedId, FeedOptions, FeedPage, ShardId, ShardSweepStats, SignalOutcome, SweepGroup,
    TransactionOptions,
};
use crate::ulid::ChangeUlid;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod postgres;
#[cfg(all(test, feature = "pg-tests"))]
mod postgres_tests;

/// Store-level tunables (the configuration surface recognized by every
/// backend; set from [`crate::config::PgfeedConfig`]).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Max unswept rows assigned per sweep batch.
    pub sweep_batch_size: usize,
    /// Sleep between sweep iterations inside a sweep loop.
    pub sweep_poll_interval: Duration,
    /// How long one writer-lock or sweep-lock acquisition may block.
    pub lock_timeout: Duration,
    /// Incident-recovery retries before giving up as a fatal
    /// coordination failure.
    pub incident_max_attempts: u32,
    /// How long a lock holder may sit idle-in-transaction before a
    /// blocked acquirer may declare an incident and burn it.
    pub incident_stall_threshold: Duration,
    pub page_size_default: usize,
    pub page_size_max: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_batch_size: 1000,
            sweep_poll_interval: Duration::from_millis(5),
            lock_timeout: Duration::from_millis(250),
            incident_max_attempts: 10,
            incident_stall_threshold: Duration::from_secs(2),
            page_size_default: 100,
            page_size_max: 1000,
        }
    }
}

impl StoreConfig {
    pub(crate) fn clamp_page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.page_size_default)
            .clamp(1, self.page_size_max)
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    /// Two sweepers overlapped on the same group and the conditional
    /// update caught it. The batch was rolled back; callers retry.
    #[error(
        "sweep race on group {group}: expected to assign {expected} rows, update touched {actual}"
    )]
    Race {
        group: SweepGroup,
        expected: u64,
        actual: u64,
    },
    /// Incident recovery retried past its budget. Operational error;
    /// never silently retried further.
    #[error(
        "writer lock on feed {feed_id} shard {shard_id} not acquired after {attempts} incident-recovery attempts"
    )]
    IncidentBudgetExhausted {
        feed_id: FeedId,
        shard_id: ShardId,
        attempts: u32,
    },
    /// No sweeper holds the group lock, so a longpoll could never be
    /// woken. Monitoring should alert on this; it is not a timeout.
    #[error("no sweeper is running for feed {feed_id} shard {shard_id}")]
    NoSweeper { feed_id: FeedId, shard_id: ShardId },
    /// An invariant the schema or protocol guarantees was observed
    /// broken. Always fatal: retrying would mask a logic defect.
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<sqlx::Error> for FeedError {
    fn from(err: sqlx::Error) -> Self {
        FeedError::Unexpected(err.into())
    }
}

impl From<sqlx::migrate::MigrateError> for FeedError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        FeedError::Unexpected(err.into())
    }
}

pub type FeedResult<T> = Result<T, FeedError>;

/// Outcome of one writer-lock acquisition attempt, as reported by a
/// backend to the bounded recovery loop in [`crate::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// Timed out behind a live, progressing holder. Retry transparently.
    Contended,
    /// Timed out behind a crashed or pathologically stalled holder; the
    /// holder was burned and the persisted incident counter is now
    /// `incident_count`.
    Incident { incident_count: i64 },
}

/// Exclusive ownership of a sweep group, held for the lifetime of a
/// sweep loop. Dropping without [`SweepGuard::release`] is a best-effort
/// release (the backing session/lock is cleaned up server-side).
#[async_trait]
pub trait SweepGuard: Send {
    async fn release(self: Box<Self>) -> FeedResult<()>;
}

/// One writer's unit of work on one shard: owns a connection (or the
/// in-memory equivalent), the shard's exclusive lock, and the ULID
/// generator state for its lifetime. Exactly one of `commit`/`rollback`
/// consumes the handle; dropping it unfinished behaves as rollback.
#[async_trait]
pub trait FeedTransaction: Send {
    fn feed_id(&self) -> FeedId;
    fn shard_id(&self) -> ShardId;
    /// The millisecond timestamp the ULID prefix was derived from.
    fn time_ms(&self) -> i64;
    /// Next key on this shard; strictly increasing for the handle's
    /// lifetime and continuing across handles while the prefix stands.
    fn next_ulid(&mut self) -> ChangeUlid;
    /// Insert a change row carrying the next key. The row becomes
    /// visible to readers only on commit.
    async fn insert_change(&mut self, payload: serde_json::Value) -> FeedResult<ChangeUlid>;
    /// Commit the data and, in the same transaction, persist the ULID
    /// state and advance the shard's sequence counter.
    async fn commit(self: Box<Self>) -> FeedResult<()>;
    /// Abandon the reserved ULID range (gaps allowed, duplicates never)
    /// and release the shard lock.
    async fn rollback(self: Box<Self>) -> FeedResult<()>;
}

/// The substrate-facing API implemented by each backend.
#[async_trait]
pub trait ChangefeedStore: Send + Sync {
    /// Register a feed and its behavior toggles. Idempotent; options of
    /// an existing feed are left untouched.
    async fn ensure_feed(&self, feed_id: FeedId, options: FeedOptions) -> FeedResult<()>;

    /// Create the shard row for a (feed, shard) pair if missing.
    /// Idempotent; called implicitly by writers on first use.
    async fn ensure_shard(&self, feed_id: FeedId, shard_id: ShardId) -> FeedResult<()>;

    /// Begin a serialized-writer transaction: acquire the shard's
    /// exclusive lock (with incident recovery) and load the ULID state.
    async fn begin(
        &self,
        feed_id: FeedId,
        shard_id: ShardId,
        options: TransactionOptions,
    ) -> FeedResult<Box<dyn FeedTransaction>>;

    /// Insert an unswept outbox row; order is assigned by a later
    /// sweep. Returns the physical insertion id.
    async fn insert_outbox(
        &self,
        feed_id: FeedId,
        shard_id: ShardId,
        time_hint_ms: Option<i64>,
        payload: serde_json::Value,
    ) -> FeedResult<i64>;

    /// Try to become the sweeper for `group`, waiting at most `wait`.
    /// `None` means someone else is actively sweeping, a success, not
    /// an error; callers treat it as zero stats.
    async fn lock_sweep_group(
        &self,
        group: SweepGroup,
        wait: Duration,
    ) -> FeedResult<Option<Box<dyn SweepGuard>>>;

    /// Run one sweep batch over the group's shards. Assumes (but does
    /// not require) the group lock; the conditional-update race check
    /// keeps overlapping sweepers from corrupting sequence numbers.
    async fn sweep_once(&self, group: SweepGroup) -> FeedResult<Vec<ShardSweepStats>>;

    async fn last_sequence_number(&self, feed_id: FeedId, shard_id: ShardId) -> FeedResult<i64>;

    /// Block until the shard advances past `seen`, the timeout elapses,
    /// or it is established that no sweeper is running. Implements the
    /// poll-block-poll protocol internally: the waiter is registered
    /// before the final re-poll, so a wakeup can never race past it.
    async fn wait_for_signal(
        &self,
        feed_id: FeedId,
        shard_id: ShardId,
        seen_sequence_number: i64,
        timeout: Duration,
    ) -> FeedResult<SignalOutcome>;

    /// Cursor-paged read of the shard's ordered rows, each strictly
    /// greater than `cursor` by key.
    async fn read_feed(
        &self,
        feed_id: FeedId,
        shard_id: ShardId,
        cursor: Cursor,
        page_size: Option<usize>,
    ) -> FeedResult<FeedPage>;

    /// Detected lock-holder crashes for the shard, monotonic.
    async fn incident_count(&self, feed_id: FeedId, shard_id: ShardId) -> FeedResult<i64>;

    async fn health_check(&self) -> FeedResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}
