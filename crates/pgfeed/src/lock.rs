//! Writer lock coordinator: bounded retry with incident recovery.
//!
//! # Purpose
//! Serializes writers for a (feed, shard) pair on a single named
//! exclusive advisory lock, and recovers from crashed holders. The
//! backend supplies one *attempt* behind [`LockAttemptPort`]: try the
//! lock with a timeout and, on timeout, decide whether the holder is
//! merely slow (contention) or dead (incident, which the attempt burns
//! and records). This module owns the policy: ordinary contention
//! retries transparently and unbounded, incidents retry up to a budget,
//! and exhausting the budget is a fatal coordination failure rather
//! than a silent loop.
//!
//! # Notes
//! Recovery is an explicit loop with a counter, not recursion, to keep
//! stack use and cancellation semantics clear. Every incident is logged
//! at `warn` and counted; contention only at `debug`.
use crate::model::{FeedId, ShardId};
use crate::store::{FeedError, FeedResult, LockAttempt};
use async_trait::async_trait;
use std::time::Duration;

/// Acquisition policy, typically derived from
/// [`crate::store::StoreConfig`].
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    /// Upper bound one attempt may block waiting for the lock.
    pub timeout: Duration,
    /// Incident-recovery attempts before giving up.
    pub max_attempts: u32,
    /// Holder stall age beyond which an attempt may declare an
    /// incident.
    pub stall_threshold: Duration,
}

/// One backend-specific acquisition attempt.
///
/// An implementation that reports [`LockAttempt::Incident`] must have
/// already burned the stuck holder and persisted the incremented
/// incident counter before returning.
#[async_trait]
pub trait LockAttemptPort: Send {
    async fn attempt(&mut self, attempt_no: u32) -> FeedResult<LockAttempt>;
}

/// What an acquisition cost, for callers that want to log or assert on
/// recovery behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireReport {
    /// Attempts made, counting the successful one.
    pub attempts: u32,
    /// Incidents this caller detected and burned along the way.
    pub incidents_detected: u32,
    /// The shard's persisted incident counter after the last detection,
    /// or 0 when none was witnessed. Opaque token: comparing values
    /// across acquisitions tells a caller whether *it* caused the bump.
    pub incident_count: i64,
}

/// Drive `port` until the lock is held.
pub async fn acquire_with_recovery(
    policy: &LockPolicy,
    feed_id: FeedId,
    shard_id: ShardId,
    port: &mut dyn LockAttemptPort,
) -> FeedResult<AcquireReport> {
    let mut report = AcquireReport::default();
    let mut incident_attempts = 0u32;
    loop {
        report.attempts += 1;
        match port.attempt(report.attempts).await? {
            LockAttempt::Acquired => {
                tracing::debug!(
                    %feed_id,
                    shard_id,
                    attempts = report.attempts,
                    incidents = report.incidents_detected,
                    "writer lock acquired"
                );
                return Ok(report);
            }
            LockAttempt::Contended => {
                // Expected under load; the holder is alive and will
                // release. Not an error, not counted against the
                // incident budget.
                tracing::debug!(%feed_id, shard_id, attempt = report.attempts, "writer lock contended, retrying");
            }
            LockAttempt::Incident { incident_count } => {
                report.incidents_detected += 1;
                report.incident_count = incident_count;
                incident_attempts += 1;
                metrics::counter!("pgfeed_incidents_total").increment(1);
                tracing::warn!(
                    %feed_id,
                    shard_id,
                    incident_count,
                    attempt = report.attempts,
                    "stuck lock holder burned, retrying acquisition"
                );
                if incident_attempts >= policy.max_attempts {
                    return Err(FeedError::IncidentBudgetExhausted {
                        feed_id,
                        shard_id,
                        attempts: incident_attempts,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn policy() -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_millis(50),
            max_attempts: 3,
            stall_threshold: Duration::from_millis(100),
        }
    }

    /// Scripted port: replays a fixed sequence of outcomes.
    struct Script(Vec<LockAttempt>, usize);

    #[async_trait]
    impl LockAttemptPort for Script {
        async fn attempt(&mut self, _attempt_no: u32) -> FeedResult<LockAttempt> {
            let outcome = self.0.get(self.1).copied().unwrap_or(LockAttempt::Acquired);
            self.1 += 1;
            Ok(outcome)
        }
    }

    #[tokio::test]
    async fn immediate_acquisition_reports_one_attempt() {
        let mut port = Script(vec![], 0);
        let report = acquire_with_recovery(&policy(), Uuid::nil(), 0, &mut port)
            .await
            .expect("acquire");
        assert_eq!(report.attempts, 1);
        assert_eq!(report.incidents_detected, 0);
    }

    #[tokio::test]
    async fn contention_retries_without_touching_incident_budget() {
        // Far more contention rounds than the incident budget allows.
        let mut port = Script(vec![LockAttempt::Contended; 9], 0);
        let report = acquire_with_recovery(&policy(), Uuid::nil(), 0, &mut port)
            .await
            .expect("acquire");
        assert_eq!(report.attempts, 10);
        assert_eq!(report.incidents_detected, 0);
    }

    #[tokio::test]
    async fn incident_then_success_is_reported() {
        let mut port = Script(vec![LockAttempt::Incident { incident_count: 4 }], 0);
        let report = acquire_with_recovery(&policy(), Uuid::nil(), 7, &mut port)
            .await
            .expect("acquire");
        assert_eq!(report.attempts, 2);
        assert_eq!(report.incidents_detected, 1);
        assert_eq!(report.incident_count, 4);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_fatal() {
        let mut port = Script(vec![LockAttempt::Incident { incident_count: 1 }; 5], 0);
        let err = acquire_with_recovery(&policy(), Uuid::nil(), 0, &mut port)
            .await
            .expect_err("must exhaust");
        match err {
            FeedError::IncidentBudgetExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn mixed_contention_and_incidents() {
        let mut port = Script(
            vec![
                LockAttempt::Contended,
                LockAttempt::Incident { incident_count: 1 },
                LockAttempt::Contended,
                LockAttempt::Incident { incident_count: 2 },
            ],
            0,
        );
        let report = acquire_with_recovery(&policy(), Uuid::nil(), 0, &mut port)
            .await
            .expect("acquire");
        assert_eq!(report.attempts, 5);
        assert_eq!(report.incidents_detected, 2);
        assert_eq!(report.incident_count, 2);
    }
}
