//! Domain types shared by every backend and driver.
//!
//! # Purpose
//! Defines feeds, shards, change rows, sweep statistics, and the paging
//! types exposed to readers. These are deliberately plain data: all
//! coordination behavior lives in the store backends and the driver
//! modules (`sweep`, `lock`, `longpoll`).
//!
//! # Notes
//! Sequence numbers start at a large base constant so they can never be
//! confused with small externally visible integers (row counts, shard
//! ids, HTTP-ish status-like values) in logs or consumer state.
use crate::cursor::Cursor;
use crate::ulid::ChangeUlid;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a logical event stream. Feeds partition into shards.
pub type FeedId = Uuid;

/// Independently ordered and locked partition of a feed.
pub type ShardId = i32;

/// Set of shards swept together under one sweeper lock.
pub type SweepGroup = i32;

/// First sequence number ever assigned on a shard.
///
/// 2e15 leaves full headroom in `i64` while keeping assigned numbers
/// visually distinct from anything a consumer could plausibly have
/// produced on its own.
pub const SEQUENCE_BASE: i64 = 2_000_000_000_000_000;

/// Per-feed behavior toggles, fixed at `ensure_feed` time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeedOptions {
    /// Writers insert into the outbox and a sweeper assigns order later
    /// (the "lazy" variant). When false, writers serialize on the shard
    /// lock and assign order at write time (the "blocking" variant).
    pub outbox: bool,
    /// Whether sweep/commit advances wake longpoll waiters for the
    /// feed's shards.
    pub longpoll: bool,
    /// Sweep group for the feed's shards; `None` for blocking feeds,
    /// which are never swept.
    pub sweep_group: Option<SweepGroup>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            outbox: true,
            longpoll: false,
            sweep_group: Some(0),
        }
    }
}

impl FeedOptions {
    /// Outbox feed swept in `group`, without longpoll.
    pub fn outbox(group: SweepGroup) -> Self {
        Self {
            outbox: true,
            longpoll: false,
            sweep_group: Some(group),
        }
    }

    /// Serialized-writers feed; order is assigned at write time.
    pub fn blocking() -> Self {
        Self {
            outbox: false,
            longpoll: false,
            sweep_group: None,
        }
    }

    pub fn with_longpoll(mut self) -> Self {
        self.longpoll = true;
        self
    }
}

/// Options for [`crate::store::ChangefeedStore::begin`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    /// Milliseconds since the Unix epoch to derive the ULID time prefix
    /// from. Defaults to the current wall clock. A hint older than the
    /// shard's stored prefix is corrected forward, never honored
    /// backward.
    pub time_hint_ms: Option<i64>,
}

/// One row of an ordered feed as returned to readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEvent {
    /// Ordering key; also the cursor value for resuming after this row.
    pub ulid: ChangeUlid,
    /// Physical insertion id. Monotonic per store, not per shard; only
    /// useful for diagnostics.
    pub change_id: i64,
    /// Dense per-shard logical order. `None` for rows written by the
    /// blocking variant before it was introduced, never `None` for
    /// swept rows.
    pub sequence_number: Option<i64>,
    pub payload: serde_json::Value,
}

/// A page of feed rows plus the cursor to resume from.
#[derive(Debug, Clone)]
pub struct FeedPage {
    pub events: Vec<FeedEvent>,
    /// Equals the last row's key, or the request cursor when the page
    /// is empty. Callers persist this verbatim between reads.
    pub next_cursor: Cursor,
}

/// Per-shard outcome of a single sweep batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSweepStats {
    pub feed_id: FeedId,
    pub shard_id: ShardId,
    /// Rows that received a sequence number in this batch.
    pub changes_assigned: i64,
    /// `last_sequence_number` before this batch advanced it.
    pub last_sequence_number_before: i64,
    /// Milliseconds since the previous sweep touched this shard.
    pub lag_milliseconds: i64,
}

/// Aggregated result of a sweep loop run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepTotals {
    pub changes_assigned: i64,
    pub iterations: u64,
    /// Batches aborted and retried because two sweepers overlapped.
    pub races_detected: u64,
    pub max_lag_milliseconds: i64,
}

impl SweepTotals {
    pub(crate) fn absorb(&mut self, stats: &[ShardSweepStats]) {
        for s in stats {
            self.changes_assigned += s.changes_assigned;
            if s.changes_assigned > 0 {
                self.max_lag_milliseconds = self.max_lag_milliseconds.max(s.lag_milliseconds);
            }
        }
        self.iterations += 1;
    }
}

/// Outcome of a backend-level wait for the shard's advance signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The shard advanced (or may have); re-read the feed.
    Signaled,
    /// The wait elapsed without a signal. Still re-read the feed: the
    /// longpoll contract never promises an update was *not* missed.
    TimedOut,
    /// Nobody is holding the sweeper lock for the shard's group, so no
    /// signal could ever arrive. Surfaced so monitoring can alert.
    NoSweeper,
}

/// Result of [`crate::longpoll::longpoll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongpollOutcome {
    /// New data is likely available.
    Ready,
    /// The timeout elapsed. Distinguished from `Ready`, but the caller
    /// must re-read the feed in both cases.
    TimedOut,
}

/// Current Unix time in milliseconds.
pub(crate) fn unix_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
