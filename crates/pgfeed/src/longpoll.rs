//! Longpoll: block a reader until a shard likely advanced.
//!
//! # Purpose
//! A message-passing substitute for a cross-process condition variable,
//! built from the substrate's blocking primitive behind a
//! poll-block-poll protocol:
//!
//! 1. immediate poll, so high-traffic feeds never block at all;
//! 2. register a waiter on the shard's advance signal;
//! 3. re-poll once the waiter is confirmed registered (closes the race
//!    between step 1 and registration);
//! 4. wait, bounded by the timeout.
//!
//! Steps 2–4 live in the backend's `wait_for_signal`, because what
//! "registered" means differs per substrate (a `LISTEN` in Postgres, an
//! armed `Notify` in memory).
//!
//! # Contract
//! Returning, with any outcome, never implies an update was missed;
//! callers must always re-read the feed afterwards. The timeout is
//! reported as a distinguished outcome, not folded into success, and
//! "no sweeper is running" is an error so monitoring can alert.
use crate::model::{FeedId, LongpollOutcome, ShardId, SignalOutcome};
use crate::store::{ChangefeedStore, FeedError, FeedResult};
use std::time::Duration;

/// Block until the shard's `last_sequence_number` moves past
/// `seen_sequence_number`, or `timeout` elapses.
pub async fn longpoll(
    store: &dyn ChangefeedStore,
    feed_id: FeedId,
    shard_id: ShardId,
    timeout: Duration,
    seen_sequence_number: i64,
) -> FeedResult<LongpollOutcome> {
    let current = store.last_sequence_number(feed_id, shard_id).await?;
    if current != seen_sequence_number {
        return Ok(LongpollOutcome::Ready);
    }

    match store
        .wait_for_signal(feed_id, shard_id, seen_sequence_number, timeout)
        .await?
    {
        SignalOutcome::Signaled => Ok(LongpollOutcome::Ready),
        SignalOutcome::TimedOut => Ok(LongpollOutcome::TimedOut),
        SignalOutcome::NoSweeper => Err(FeedError::NoSweeper { feed_id, shard_id }),
    }
}
