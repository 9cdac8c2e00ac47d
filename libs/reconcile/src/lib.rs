//! Reconciliation primitives.
//!
//! Helpers for converging the controller's persisted view of allocations
//! with what agents actually run:
//!
//! - **Backoff**: exponential retry delays with jitter for agent RPCs.
//! - **Retry accounting**: bounded attempts per operation within a window.
//! - **Deadlines**: bounded grace periods (reattachment, stop grace).
//! - **Reattachment**: a pure decision function mapping a persisted state
//!   and an observation of the agents to the action the controller takes.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Applying a decision to an already-reconciled allocation is a no-op

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use gantry_events::{AllocationState, ExitOutcome, LiveStatus, TerminatingReason};
use rand::Rng;
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Timeout waiting for an agent.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    /// Retries exhausted for an operation.
    #[error("retries exhausted for {0}")]
    Exhausted(String),
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// No delay at all. Used by tests and the in-process agent.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(32) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// Retry Accounting
// =============================================================================

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker<K: Ord> {
    /// Maximum retries per key.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// key -> (count, first_failure_time).
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord> RetryTracker<K> {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure. Returns true if retries are exhausted.
    pub fn record_failure(&mut self, key: K) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    pub fn is_exhausted(&self, key: &K) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= window);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

// =============================================================================
// Deadlines
// =============================================================================

/// A point in time after which waiting stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: started + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The timeout error for `resource` if the deadline has passed.
    pub fn check(&self, resource: impl Into<String>) -> Result<(), ReconcileError> {
        if self.is_expired() {
            return Err(ReconcileError::Timeout {
                resource: resource.into(),
                elapsed: self.elapsed(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Reattachment
// =============================================================================

/// What the controller learned about an allocation from its agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReattachObservation {
    /// Every owning agent answered.
    Live(LiveStatus),
    /// At least one owning agent did not answer within the grace period.
    Unreachable,
}

impl ReattachObservation {
    /// Folds per-agent answers of a multi-agent allocation into one
    /// observation. `None` marks an agent that did not answer.
    ///
    /// Unreachable dominates, then gone, then waiting.
    pub fn combine<I>(answers: I) -> Self
    where
        I: IntoIterator<Item = Option<LiveStatus>>,
    {
        let mut combined = LiveStatus::Running;
        let mut any = false;
        for answer in answers {
            any = true;
            match answer {
                None => return ReattachObservation::Unreachable,
                Some(LiveStatus::Gone) => combined = LiveStatus::Gone,
                Some(LiveStatus::Waiting) if combined != LiveStatus::Gone => {
                    combined = LiveStatus::Waiting
                }
                Some(_) => {}
            }
        }
        if !any {
            return ReattachObservation::Unreachable;
        }
        ReattachObservation::Live(combined)
    }
}

/// Action the controller takes for one persisted allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReattachDecision {
    /// Nothing to do.
    Unchanged,
    /// Re-bind the recorded slots and enter `state` (`Running` or `Waiting`).
    Resume { state: AllocationState },
    /// The processes are gone; finish with `outcome` without teardown.
    Settle { outcome: ExitOutcome },
    /// Enter `Terminating(reason)` and run the standard teardown.
    Teardown { reason: TerminatingReason },
    /// Already terminating and the agent still runs it; re-issue the stop.
    ContinueTeardown,
}

impl ReattachDecision {
    /// Whether applying the decision mutates the allocation state.
    pub fn is_transition(&self, persisted: AllocationState) -> bool {
        match self {
            ReattachDecision::Unchanged | ReattachDecision::ContinueTeardown => false,
            ReattachDecision::Resume { state } => *state != persisted,
            ReattachDecision::Settle { .. } | ReattachDecision::Teardown { .. } => true,
        }
    }
}

/// Decides how to reconcile a persisted allocation against live agents.
pub fn classify_reattach(
    persisted: AllocationState,
    observation: ReattachObservation,
) -> ReattachDecision {
    use AllocationState as S;

    match (persisted, observation) {
        // Nothing was launched for these.
        (S::Pending | S::Terminated { .. }, _) => ReattachDecision::Unchanged,

        (S::Terminating { reason }, ReattachObservation::Live(LiveStatus::Gone)) => {
            ReattachDecision::Settle {
                outcome: reason.into(),
            }
        }
        (S::Terminating { .. }, _) => ReattachDecision::ContinueTeardown,

        (_, ReattachObservation::Live(LiveStatus::Running)) => ReattachDecision::Resume {
            state: S::Running,
        },
        (_, ReattachObservation::Live(LiveStatus::Waiting)) => ReattachDecision::Resume {
            state: S::Waiting,
        },
        (_, ReattachObservation::Live(LiveStatus::Gone)) => ReattachDecision::Settle {
            outcome: ExitOutcome::AgentLost,
        },
        (_, ReattachObservation::Unreachable) => ReattachDecision::Teardown {
            reason: TerminatingReason::AgentLost,
        },
    }
}

/// Default scheduler tick.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Default retry window for agent RPCs.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const PREEMPTING: AllocationState = AllocationState::Terminating {
        reason: TerminatingReason::Preempted,
    };

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            jitter: 0.25,
        };
        for _ in 0..100 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_millis(750), "{delay:?}");
            assert!(delay <= Duration::from_millis(1250), "{delay:?}");
        }
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("start")); // 1st
        assert!(!tracker.record_failure("start")); // 2nd
        assert!(!tracker.record_failure("start")); // 3rd
        assert!(tracker.record_failure("start")); // 4th - exhausted

        assert!(tracker.is_exhausted(&"start"));
        assert!(!tracker.is_exhausted(&"stop"));
        assert_eq!(tracker.failures(&"start"), 4);

        tracker.clear(&"start");
        assert!(!tracker.is_exhausted(&"start"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_deadline() {
        let expired = Deadline::after(Duration::ZERO);
        assert!(expired.is_expired());
        assert_eq!(expired.remaining(), Duration::ZERO);
        assert!(matches!(
            expired.check("agent"),
            Err(ReconcileError::Timeout { .. })
        ));

        let later = Deadline::after(Duration::from_secs(60));
        assert!(!later.is_expired());
        assert!(later.check("agent").is_ok());
    }

    #[rstest]
    #[case(vec![Some(LiveStatus::Running), Some(LiveStatus::Running)], ReattachObservation::Live(LiveStatus::Running))]
    #[case(vec![Some(LiveStatus::Running), Some(LiveStatus::Waiting)], ReattachObservation::Live(LiveStatus::Waiting))]
    #[case(vec![Some(LiveStatus::Gone), Some(LiveStatus::Waiting)], ReattachObservation::Live(LiveStatus::Gone))]
    #[case(vec![Some(LiveStatus::Gone), None], ReattachObservation::Unreachable)]
    #[case(vec![], ReattachObservation::Unreachable)]
    fn test_combine_observations(
        #[case] answers: Vec<Option<LiveStatus>>,
        #[case] expected: ReattachObservation,
    ) {
        assert_eq!(ReattachObservation::combine(answers), expected);
    }

    #[rstest]
    #[case(AllocationState::Running, ReattachObservation::Live(LiveStatus::Running), ReattachDecision::Resume { state: AllocationState::Running })]
    #[case(AllocationState::Assigned, ReattachObservation::Live(LiveStatus::Waiting), ReattachDecision::Resume { state: AllocationState::Waiting })]
    #[case(AllocationState::Starting, ReattachObservation::Live(LiveStatus::Gone), ReattachDecision::Settle { outcome: ExitOutcome::AgentLost })]
    #[case(AllocationState::Waiting, ReattachObservation::Unreachable, ReattachDecision::Teardown { reason: TerminatingReason::AgentLost })]
    #[case(PREEMPTING, ReattachObservation::Live(LiveStatus::Gone), ReattachDecision::Settle { outcome: ExitOutcome::Preempted })]
    #[case(PREEMPTING, ReattachObservation::Live(LiveStatus::Running), ReattachDecision::ContinueTeardown)]
    #[case(PREEMPTING, ReattachObservation::Unreachable, ReattachDecision::ContinueTeardown)]
    #[case(AllocationState::Pending, ReattachObservation::Unreachable, ReattachDecision::Unchanged)]
    fn test_classify_reattach(
        #[case] persisted: AllocationState,
        #[case] observation: ReattachObservation,
        #[case] expected: ReattachDecision,
    ) {
        assert_eq!(classify_reattach(persisted, observation), expected);
    }

    #[test]
    fn test_reclassifying_resumed_state_is_not_a_transition() {
        let first = classify_reattach(
            AllocationState::Starting,
            ReattachObservation::Live(LiveStatus::Running),
        );
        assert!(first.is_transition(AllocationState::Starting));

        let again = classify_reattach(
            AllocationState::Running,
            ReattachObservation::Live(LiveStatus::Running),
        );
        assert_eq!(again, first);
        assert!(!again.is_transition(AllocationState::Running));
    }

    #[test]
    fn test_decisions_respect_transition_table() {
        let states = [
            AllocationState::Assigned,
            AllocationState::Starting,
            AllocationState::Waiting,
            AllocationState::Running,
            PREEMPTING,
        ];
        let observations = [
            ReattachObservation::Live(LiveStatus::Running),
            ReattachObservation::Live(LiveStatus::Waiting),
            ReattachObservation::Live(LiveStatus::Gone),
            ReattachObservation::Unreachable,
        ];
        for persisted in states {
            for observation in observations {
                let next = match classify_reattach(persisted, observation) {
                    // Resuming from assigned passes through starting.
                    ReattachDecision::Resume { state } if persisted == AllocationState::Assigned => {
                        assert!(AllocationState::Starting.can_transition_to(&state));
                        continue;
                    }
                    ReattachDecision::Resume { state } => state,
                    ReattachDecision::Settle { outcome } => AllocationState::Terminated { outcome },
                    ReattachDecision::Teardown { reason } => AllocationState::Terminating { reason },
                    _ => continue,
                };
                assert!(
                    next == persisted || persisted.can_transition_to(&next),
                    "{persisted} -> {next}"
                );
            }
        }
    }

    mod props {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn prop_backoff_never_exceeds_max_plus_jitter(attempt in 0u32..64, base_ms in 1u64..500) {
                let policy = BackoffPolicy {
                    base: Duration::from_millis(base_ms),
                    max: Duration::from_secs(5),
                    jitter: 0.1,
                };
                prop_assert!(policy.delay(attempt) <= Duration::from_millis(5500));
            }
        }
    }
}
