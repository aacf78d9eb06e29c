//! Sweep drivers: batch sequence assignment and the sweeper loop.
//!
//! # Purpose
//! The backend's `sweep_once` assigns order to one batch of unswept
//! rows; this module owns the surrounding policy. [`sweep`] is the
//! single-shot form that surfaces a detected race to the caller.
//! [`sweep_loop`] is what a sweeper daemon runs: take the group's
//! exclusive lock (bounded wait; losing it to another sweeper is a
//! no-op success, not an error), then iterate batches for a bounded
//! wall-clock duration with a short sleep between iterations,
//! accumulating totals. A race aborts only the in-flight batch; the
//! loop absorbs it and retries on the next iteration.
use crate::model::{ShardSweepStats, SweepGroup, SweepTotals};
use crate::store::{ChangefeedStore, FeedError, FeedResult};
use std::time::Duration;
use tokio::time::Instant;

/// Timing knobs for one [`sweep_loop`] run.
#[derive(Debug, Clone, Copy)]
pub struct SweepLoopOptions {
    /// How long to wait for the group lock before concluding someone
    /// else is sweeping.
    pub wait: Duration,
    /// Wall-clock budget for the whole loop once the lock is held.
    pub duration: Duration,
    /// Sleep between iterations (tight-poll interval).
    pub sleep: Duration,
}

impl Default for SweepLoopOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(1000),
            duration: Duration::from_millis(1000),
            sleep: Duration::from_millis(5),
        }
    }
}

/// Assign order to one batch of unswept rows in `group`.
///
/// Errors with [`FeedError::Race`] when a concurrent sweeper got to the
/// same rows first; the batch rolled back cleanly and the caller may
/// simply retry.
pub async fn sweep(
    store: &dyn ChangefeedStore,
    group: SweepGroup,
) -> FeedResult<Vec<ShardSweepStats>> {
    let stats = store.sweep_once(group).await?;
    let assigned: i64 = stats.iter().map(|s| s.changes_assigned).sum();
    if assigned > 0 {
        metrics::counter!("pgfeed_changes_swept_total").increment(assigned as u64);
    }
    Ok(stats)
}

/// Run a full sweeper pass over `group`.
///
/// Returns zero totals when another sweeper holds the group lock; the
/// caller must treat that as success.
pub async fn sweep_loop(
    store: &dyn ChangefeedStore,
    group: SweepGroup,
    options: SweepLoopOptions,
) -> FeedResult<SweepTotals> {
    let mut totals = SweepTotals::default();
    let Some(guard) = store.lock_sweep_group(group, options.wait).await? else {
        tracing::debug!(group, "sweep group already owned, yielding");
        return Ok(totals);
    };

    let deadline = Instant::now() + options.duration;
    let result = loop {
        match store.sweep_once(group).await {
            Ok(stats) => totals.absorb(&stats),
            Err(FeedError::Race {
                group,
                expected,
                actual,
            }) => {
                // Self-healing: the overlapping sweeper assigned the
                // rows; nothing was corrupted.
                totals.races_detected += 1;
                metrics::counter!("pgfeed_sweep_races_total").increment(1);
                tracing::warn!(group, expected, actual, "sweep race detected, retrying batch");
            }
            Err(other) => break Err(other),
        }
        if Instant::now() >= deadline {
            break Ok(());
        }
        tokio::time::sleep(options.sleep).await;
    };

    guard.release().await?;
    result?;

    if totals.changes_assigned > 0 {
        metrics::counter!("pgfeed_changes_swept_total").increment(totals.changes_assigned as u64);
        metrics::gauge!("pgfeed_sweep_lag_milliseconds").set(totals.max_lag_milliseconds as f64);
    }
    Ok(totals)
}
