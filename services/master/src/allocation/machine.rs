//! The allocation state machine.
//!
//! [`apply`] folds one typed event into an allocation and returns the
//! history entries it produced plus the side effects the controller must
//! carry out. It performs no I/O, so a recorded event sequence replays to
//! the same result.
//!
//! Events that make no sense in the current state are ignored: duplicate
//! and late deliveries are normal, and the outcome is then empty.

use chrono::{DateTime, Utc};
use gantry_events::{
    event_types, AgentEvent, AllocationEvent, AllocationEventEnvelope, AllocationState,
    LiveStatus, SchedulerEvent, SignalEvent, StopMode, TerminatingReason, TimerEvent,
};
use gantry_id::AgentId;
use tracing::error;

use super::Allocation;

/// Work the controller performs after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Unbind every registry slot of the allocation.
    ReleaseSlots,
    SendStart { agents: Vec<AgentId> },
    SendStop { agents: Vec<AgentId>, mode: StopMode },
    ArmTimer(TimerEvent),
    /// Drop the request from its pool's queue.
    Dequeue,
    CloseLogs,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Outcome {
    pub history: Vec<AllocationEventEnvelope>,
    pub effects: Vec<Effect>,
}

impl Outcome {
    pub fn is_empty(&self) -> bool {
        self.history.is_empty() && self.effects.is_empty()
    }
}

/// Fold `event` into `alloc`.
pub fn apply(alloc: &mut Allocation, event: &AllocationEvent, now: DateTime<Utc>) -> Outcome {
    let mut step = Step::new(alloc, now);
    if step.alloc.is_terminal() {
        return step.out;
    }

    match event {
        AllocationEvent::Scheduler(event) => step.scheduler(event),
        AllocationEvent::Agent(event) => step.agent(event),
        AllocationEvent::Signal(signal) => step.signal(*signal),
        AllocationEvent::Timer(timer) => step.timer(*timer),
    }
    step.out
}

/// Tear an allocation down as failed, whatever state it is in.
///
/// Used when the controller itself detects an unrecoverable problem, such
/// as the registry refusing a bind.
pub fn force_fail(
    alloc: &mut Allocation,
    cause: &str,
    detail: String,
    now: DateTime<Utc>,
) -> Outcome {
    let mut step = Step::new(alloc, now);
    match step.alloc.state {
        AllocationState::Terminated { .. } => {}
        AllocationState::Terminating { .. } => step.settle(cause),
        AllocationState::Pending => {
            step.out.effects.push(Effect::Dequeue);
            step.teardown(TerminatingReason::Failed, cause, Some(detail));
        }
        _ => step.teardown(TerminatingReason::Failed, cause, Some(detail)),
    }
    step.out
}

struct Step<'a> {
    alloc: &'a mut Allocation,
    now: DateTime<Utc>,
    out: Outcome,
}

impl<'a> Step<'a> {
    fn new(alloc: &'a mut Allocation, now: DateTime<Utc>) -> Self {
        Self {
            alloc,
            now,
            out: Outcome::default(),
        }
    }

    fn scheduler(&mut self, event: &SchedulerEvent) {
        match (event, self.alloc.state) {
            (SchedulerEvent::Assign { slots }, AllocationState::Pending) => {
                self.alloc.slots = slots.clone();
                self.alloc.acked.clear();
                self.alloc.assigned_at = Some(self.now);
                if self.transition(AllocationState::Assigned, event_types::SCHEDULER_ASSIGN, None) {
                    let agents = self.alloc.agents().into_iter().collect();
                    self.effect(Effect::Dequeue);
                    self.effect(Effect::SendStart { agents });
                    self.effect(Effect::ArmTimer(TimerEvent::StartDeadline));
                }
            }
            (SchedulerEvent::Preempt, state) if state.holds_slots() => {
                self.teardown(TerminatingReason::Preempted, event_types::SCHEDULER_PREEMPT, None)
            }
            _ => {}
        }
    }

    fn agent(&mut self, event: &AgentEvent) {
        let state = self.alloc.state;
        match event {
            AgentEvent::StartAcked { agent_id } => {
                if state != AllocationState::Assigned || !self.owns(agent_id) {
                    return;
                }
                self.alloc.acked.insert(*agent_id);
                if self.alloc.acked == self.alloc.agents() {
                    self.transition(AllocationState::Starting, event_types::AGENT_START_ACKED, None);
                }
            }

            AgentEvent::StartFailed { agent_id, message } => {
                if !matches!(state, AllocationState::Assigned | AllocationState::Starting)
                    || !self.owns(agent_id)
                {
                    return;
                }
                self.alloc.exits.insert(*agent_id, false);
                self.alloc.message = Some(message.clone());
                self.teardown(
                    TerminatingReason::Failed,
                    event_types::AGENT_START_FAILED,
                    Some(format!("{agent_id}: {message}")),
                );
            }

            AgentEvent::Exited {
                agent_id,
                success,
                exit_code,
            } => {
                if state == AllocationState::Pending || !self.owns(agent_id) {
                    return;
                }
                if self.alloc.exits.contains_key(agent_id) {
                    return;
                }
                self.alloc.exits.insert(*agent_id, *success);

                if state.is_terminating() {
                    if self.alloc.remaining_agents().is_empty() {
                        self.settle(event_types::AGENT_EXITED);
                    }
                    return;
                }

                if !success {
                    let detail = match exit_code {
                        Some(code) => format!("{agent_id} exited with code {code}"),
                        None => format!("{agent_id} exited unsuccessfully"),
                    };
                    self.alloc.message = Some(detail.clone());
                    self.teardown(TerminatingReason::Failed, event_types::AGENT_EXITED, Some(detail));
                } else if self.alloc.remaining_agents().is_empty() {
                    self.teardown(TerminatingReason::Completed, event_types::AGENT_EXITED, None);
                }
            }

            AgentEvent::Lost { agent_id } => {
                if state == AllocationState::Pending || !self.owns(agent_id) {
                    return;
                }
                self.alloc.exits.entry(*agent_id).or_insert(false);
                if state.is_terminating() {
                    if self.alloc.remaining_agents().is_empty() {
                        self.settle(event_types::AGENT_LOST);
                    }
                    return;
                }
                self.teardown(
                    TerminatingReason::AgentLost,
                    event_types::AGENT_LOST,
                    Some(format!("{agent_id} lost")),
                );
            }

            AgentEvent::Reattached { status } => match state {
                AllocationState::Terminating { .. } => self.stop_remaining(StopMode::Graceful),
                s if s.holds_slots() => self.resume(*status),
                _ => {}
            },

            AgentEvent::Vanished => self.vanished(),

            AgentEvent::Unreachable => match state {
                AllocationState::Terminating { .. } => self.stop_remaining(StopMode::Graceful),
                s if s.holds_slots() => self.teardown(
                    TerminatingReason::AgentLost,
                    event_types::AGENT_UNREACHABLE,
                    Some("agents unreachable after restart".to_string()),
                ),
                _ => {}
            },
        }
    }

    fn signal(&mut self, signal: SignalEvent) {
        let state = self.alloc.state;
        match signal {
            SignalEvent::Cancel => match state {
                AllocationState::Pending => {
                    self.effect(Effect::Dequeue);
                    let cancelled = AllocationState::Terminated {
                        outcome: TerminatingReason::Cancelled.into(),
                    };
                    if self.transition(cancelled, event_types::SIGNAL_CANCEL, None) {
                        self.effect(Effect::CloseLogs);
                    }
                }
                s if s.holds_slots() => {
                    self.teardown(TerminatingReason::Cancelled, event_types::SIGNAL_CANCEL, None)
                }
                _ => {}
            },
            SignalEvent::Ready => self.report(AllocationState::Running, event_types::SIGNAL_READY),
            SignalEvent::Waiting => {
                self.report(AllocationState::Waiting, event_types::SIGNAL_WAITING)
            }
        }
    }

    fn timer(&mut self, timer: TimerEvent) {
        let state = self.alloc.state;
        match (timer, state) {
            (TimerEvent::StartDeadline, AllocationState::Assigned) => self.teardown(
                TerminatingReason::Failed,
                event_types::TIMER_START_DEADLINE,
                Some("start was not acknowledged in time".to_string()),
            ),
            (TimerEvent::StopGraceExpired, AllocationState::Terminating { .. }) => {
                let remaining = self.alloc.remaining_agents();
                if remaining.is_empty() {
                    self.settle(event_types::TIMER_STOP_GRACE_EXPIRED);
                    return;
                }
                self.effect(Effect::SendStop {
                    agents: remaining,
                    mode: StopMode::Force,
                });
                self.effect(Effect::ArmTimer(TimerEvent::ForceStopExpired));
            }
            (TimerEvent::ForceStopExpired, AllocationState::Terminating { .. }) => {
                self.settle(event_types::TIMER_FORCE_STOP_EXPIRED)
            }
            _ => {}
        }
    }

    /// Readiness and waiting reports from the task itself.
    fn report(&mut self, target: AllocationState, cause: &str) {
        match self.alloc.state {
            AllocationState::Assigned => {
                // The task is talking to us, so every agent has started it.
                self.alloc.acked = self.alloc.agents();
                if self.transition(AllocationState::Starting, cause, None) {
                    self.transition(target, cause, None);
                }
            }
            AllocationState::Starting | AllocationState::Waiting | AllocationState::Running => {
                if self.alloc.state != target {
                    self.transition(target, cause, None);
                }
            }
            _ => {}
        }
    }

    fn resume(&mut self, status: LiveStatus) {
        let target = match status {
            LiveStatus::Running => AllocationState::Running,
            LiveStatus::Waiting => AllocationState::Waiting,
            LiveStatus::Gone => return self.vanished(),
        };
        if self.alloc.state == AllocationState::Assigned {
            self.alloc.acked = self.alloc.agents();
            if !self.transition(AllocationState::Starting, event_types::AGENT_REATTACHED, None) {
                return;
            }
        }
        if self.alloc.state != target {
            self.transition(target, event_types::AGENT_REATTACHED, None);
        }
    }

    fn vanished(&mut self) {
        match self.alloc.state {
            AllocationState::Terminating { .. } => self.settle(event_types::AGENT_VANISHED),
            s if s.holds_slots() => {
                self.effect(Effect::ReleaseSlots);
                let lost = AllocationState::Terminated {
                    outcome: TerminatingReason::AgentLost.into(),
                };
                if self.transition(lost, event_types::AGENT_VANISHED, None) {
                    self.effect(Effect::CloseLogs);
                }
            }
            _ => {}
        }
    }

    /// Enter `Terminating(reason)`, release capacity, and stop what is left.
    fn teardown(&mut self, reason: TerminatingReason, cause: &str, detail: Option<String>) {
        let held = self.alloc.state.holds_slots();
        if !self.transition(AllocationState::Terminating { reason }, cause, detail) {
            return;
        }
        if held {
            self.effect(Effect::ReleaseSlots);
        }
        self.stop_remaining(StopMode::Graceful);
    }

    fn stop_remaining(&mut self, mode: StopMode) {
        let remaining = self.alloc.remaining_agents();
        if remaining.is_empty() {
            self.settle(event_types::CONTROLLER_SETTLED);
            return;
        }
        self.effect(Effect::SendStop {
            agents: remaining,
            mode,
        });
        self.effect(Effect::ArmTimer(TimerEvent::StopGraceExpired));
    }

    /// `Terminating(reason)` becomes `Terminated(reason)`.
    fn settle(&mut self, cause: &str) {
        let AllocationState::Terminating { reason } = self.alloc.state else {
            return;
        };
        let done = AllocationState::Terminated {
            outcome: reason.into(),
        };
        if self.transition(done, cause, None) {
            self.effect(Effect::CloseLogs);
        }
    }

    fn owns(&self, agent_id: &AgentId) -> bool {
        self.alloc.slots.iter().any(|s| s.agent == *agent_id)
    }

    fn effect(&mut self, effect: Effect) {
        self.out.effects.push(effect);
    }

    fn transition(&mut self, to: AllocationState, cause: &str, detail: Option<String>) -> bool {
        let from = self.alloc.state;
        if !from.can_transition_to(&to) {
            error!(
                allocation_id = %self.alloc.id,
                %from,
                %to,
                cause,
                invariant_violation = true,
                "Refusing illegal allocation transition"
            );
            return false;
        }

        self.alloc.last_seq = self.alloc.last_seq.next();
        self.alloc.state = to;
        match to {
            AllocationState::Starting => {
                self.alloc.started_at.get_or_insert(self.now);
            }
            AllocationState::Running => self.alloc.ready_at = Some(self.now),
            AllocationState::Terminated { outcome } => {
                self.alloc.outcome = Some(outcome);
                self.alloc.ended_at = Some(self.now);
            }
            _ => {}
        }

        self.out.history.push(AllocationEventEnvelope {
            allocation_id: self.alloc.id,
            seq: self.alloc.last_seq,
            occurred_at: self.now,
            from: Some(from),
            to,
            cause: cause.to_string(),
            detail,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use gantry_events::ExitOutcome;
    use gantry_id::{Seq, SlotId};
    use rstest::rstest;

    use super::*;
    use crate::pool::TaskRequest;

    fn assigned(agents: usize) -> (Allocation, Vec<AgentId>) {
        let ids: Vec<AgentId> = (0..agents).map(|_| AgentId::new()).collect();
        let mut alloc = Allocation::new(
            TaskRequest::builder("compute")
                .gpus(agents as u32)
                .spread()
                .build(),
        );
        let slots = ids.iter().map(|a| SlotId::new(*a, 0)).collect();
        let out = apply(
            &mut alloc,
            &SchedulerEvent::Assign { slots }.into(),
            Utc::now(),
        );
        assert_eq!(alloc.state, AllocationState::Assigned);
        assert!(out.effects.contains(&Effect::ArmTimer(TimerEvent::StartDeadline)));
        (alloc, ids)
    }

    fn feed(alloc: &mut Allocation, event: impl Into<AllocationEvent>) -> Outcome {
        apply(alloc, &event.into(), Utc::now())
    }

    fn running(agents: usize) -> (Allocation, Vec<AgentId>) {
        let (mut alloc, ids) = assigned(agents);
        for id in &ids {
            feed(&mut alloc, AgentEvent::StartAcked { agent_id: *id });
        }
        feed(&mut alloc, SignalEvent::Ready);
        assert_eq!(alloc.state, AllocationState::Running);
        (alloc, ids)
    }

    #[test]
    fn test_happy_path_completes_with_success() {
        let (mut alloc, ids) = running(1);

        let out = feed(
            &mut alloc,
            AgentEvent::Exited {
                agent_id: ids[0],
                success: true,
                exit_code: Some(0),
            },
        );

        let states: Vec<_> = out.history.iter().map(|e| e.to).collect();
        assert_eq!(
            states,
            vec![
                AllocationState::Terminating {
                    reason: TerminatingReason::Completed
                },
                AllocationState::Terminated {
                    outcome: ExitOutcome::Success
                },
            ]
        );
        assert_eq!(out.history[1].cause, event_types::CONTROLLER_SETTLED);
        assert!(out.effects.contains(&Effect::ReleaseSlots));
        assert!(out.effects.contains(&Effect::CloseLogs));
        assert_eq!(alloc.outcome, Some(ExitOutcome::Success));
        // submitted, assigned, starting, running, terminating, terminated
        assert_eq!(alloc.last_seq, Seq::new(6));
    }

    #[test]
    fn test_start_needs_every_agent() {
        let (mut alloc, ids) = assigned(2);
        let out = feed(&mut alloc, AgentEvent::StartAcked { agent_id: ids[0] });
        assert!(out.history.is_empty());
        assert_eq!(alloc.state, AllocationState::Assigned);

        feed(&mut alloc, AgentEvent::StartAcked { agent_id: ids[1] });
        assert_eq!(alloc.state, AllocationState::Starting);
        assert!(alloc.started_at.is_some());
    }

    #[test]
    fn test_waiting_and_running_alternate() {
        let (mut alloc, _) = running(1);
        for _ in 0..3 {
            feed(&mut alloc, SignalEvent::Waiting);
            assert_eq!(alloc.state, AllocationState::Waiting);
            feed(&mut alloc, SignalEvent::Ready);
            assert_eq!(alloc.state, AllocationState::Running);
        }
        // Duplicate signals are no-ops.
        assert!(feed(&mut alloc, SignalEvent::Ready).is_empty());
    }

    #[test]
    fn test_preempt_stops_gracefully_then_forces() {
        let (mut alloc, ids) = running(1);

        let out = feed(&mut alloc, SchedulerEvent::Preempt);
        assert_eq!(
            alloc.state,
            AllocationState::Terminating {
                reason: TerminatingReason::Preempted
            }
        );
        assert_eq!(
            out.effects,
            vec![
                Effect::ReleaseSlots,
                Effect::SendStop {
                    agents: ids.clone(),
                    mode: StopMode::Graceful
                },
                Effect::ArmTimer(TimerEvent::StopGraceExpired),
            ]
        );

        let out = feed(&mut alloc, TimerEvent::StopGraceExpired);
        assert_eq!(
            out.effects,
            vec![
                Effect::SendStop {
                    agents: ids,
                    mode: StopMode::Force
                },
                Effect::ArmTimer(TimerEvent::ForceStopExpired),
            ]
        );

        feed(&mut alloc, TimerEvent::ForceStopExpired);
        assert_eq!(alloc.outcome, Some(ExitOutcome::Preempted));
    }

    #[test]
    fn test_exit_during_teardown_settles() {
        let (mut alloc, ids) = running(1);
        feed(&mut alloc, SignalEvent::Cancel);
        feed(
            &mut alloc,
            AgentEvent::Exited {
                agent_id: ids[0],
                success: false,
                exit_code: Some(143),
            },
        );
        assert_eq!(
            alloc.state,
            AllocationState::Terminated {
                outcome: ExitOutcome::Cancelled
            }
        );
    }

    #[test]
    fn test_cancel_pending_skips_teardown() {
        let mut alloc = Allocation::new(TaskRequest::builder("compute").build());
        let out = feed(&mut alloc, SignalEvent::Cancel);
        assert_eq!(out.history.len(), 1);
        assert_eq!(out.effects, vec![Effect::Dequeue, Effect::CloseLogs]);
        assert_eq!(alloc.outcome, Some(ExitOutcome::Cancelled));
    }

    #[test]
    fn test_failed_exit_fails_whole_allocation() {
        let (mut alloc, ids) = running(2);
        let out = feed(
            &mut alloc,
            AgentEvent::Exited {
                agent_id: ids[0],
                success: false,
                exit_code: Some(1),
            },
        );
        assert_eq!(
            alloc.state,
            AllocationState::Terminating {
                reason: TerminatingReason::Failed
            }
        );
        assert!(out.effects.contains(&Effect::SendStop {
            agents: vec![ids[1]],
            mode: StopMode::Graceful
        }));
    }

    #[test]
    fn test_partial_success_waits_for_all_agents() {
        let (mut alloc, ids) = running(2);
        let out = feed(
            &mut alloc,
            AgentEvent::Exited {
                agent_id: ids[0],
                success: true,
                exit_code: None,
            },
        );
        assert!(out.history.is_empty());
        assert_eq!(alloc.state, AllocationState::Running);
    }

    #[test]
    fn test_lost_agent_tears_down() {
        let (mut alloc, ids) = running(1);
        let out = feed(&mut alloc, AgentEvent::Lost { agent_id: ids[0] });
        // The only agent is gone, so there is nothing left to stop.
        assert_eq!(
            alloc.state,
            AllocationState::Terminated {
                outcome: ExitOutcome::AgentLost
            }
        );
        assert_eq!(out.history.len(), 2);
        assert!(out.effects.contains(&Effect::ReleaseSlots));
    }

    #[test]
    fn test_start_deadline_fails_only_assigned() {
        let (mut alloc, _) = assigned(1);
        feed(&mut alloc, TimerEvent::StartDeadline);
        assert_eq!(
            alloc.state,
            AllocationState::Terminating {
                reason: TerminatingReason::Failed
            }
        );

        let (mut started, ids) = assigned(1);
        feed(&mut started, AgentEvent::StartAcked { agent_id: ids[0] });
        assert!(feed(&mut started, TimerEvent::StartDeadline).is_empty());
    }

    #[rstest]
    #[case(LiveStatus::Running, AllocationState::Running)]
    #[case(LiveStatus::Waiting, AllocationState::Waiting)]
    fn test_reattach_resumes_assigned(#[case] status: LiveStatus, #[case] expected: AllocationState) {
        let (mut alloc, _) = assigned(1);
        let out = feed(&mut alloc, AgentEvent::Reattached { status });
        assert_eq!(alloc.state, expected);
        assert_eq!(out.history[0].to, AllocationState::Starting);
        assert!(out.effects.is_empty());

        // Replaying the same report changes nothing.
        assert!(feed(&mut alloc, AgentEvent::Reattached { status }).is_empty());
    }

    #[test]
    fn test_vanished_goes_straight_to_terminated() {
        let (mut alloc, _) = running(1);
        let out = feed(&mut alloc, AgentEvent::Vanished);
        assert_eq!(
            alloc.state,
            AllocationState::Terminated {
                outcome: ExitOutcome::AgentLost
            }
        );
        assert_eq!(out.effects, vec![Effect::ReleaseSlots, Effect::CloseLogs]);
    }

    #[test]
    fn test_terminated_is_final() {
        let (mut alloc, ids) = running(1);
        feed(&mut alloc, AgentEvent::Vanished);
        let before = alloc.clone();

        let events: Vec<AllocationEvent> = vec![
            SignalEvent::Ready.into(),
            SignalEvent::Cancel.into(),
            SchedulerEvent::Preempt.into(),
            AgentEvent::Lost { agent_id: ids[0] }.into(),
            AgentEvent::Reattached {
                status: LiveStatus::Running,
            }
            .into(),
            TimerEvent::ForceStopExpired.into(),
        ];
        for event in events {
            assert!(apply(&mut alloc, &event, Utc::now()).is_empty());
        }
        assert_eq!(alloc, before);
    }

    #[test]
    fn test_force_fail_pending() {
        let mut alloc = Allocation::new(TaskRequest::builder("compute").build());
        let out = force_fail(
            &mut alloc,
            event_types::REGISTRY_CONFLICT,
            "slot taken".to_string(),
            Utc::now(),
        );
        assert_eq!(alloc.outcome, Some(ExitOutcome::Failed));
        assert_eq!(out.history[0].detail.as_deref(), Some("slot taken"));
        assert!(out.effects.contains(&Effect::Dequeue));
    }
}
