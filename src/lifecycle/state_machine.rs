//! Pure transition function for the task lifecycle.
//!
//! ```text
//! Accepted --placed--> Launched --> StartInitiated --> Started
//!     |                   |               |               |
//!     +------- kill ------+------ kill ---+----- kill ----+--> KillInitiated
//!     |                                                            |
//!     +-------------------------- Finished(reason) <---------------+
//! ```
//!
//! Every non-terminal state may jump straight to `Finished`. Nothing leaves
//! `Finished`.

use crate::model::{FinishReason, TaskState};

/// Inputs understood by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    PlacementSucceeded,
    PlacementFailed,
    AgentReported(TaskState),
    KillRequested,
    TimeoutExpired,
    AgentLost,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskEvent::PlacementSucceeded => write!(f, "placement_succeeded"),
            TaskEvent::PlacementFailed => write!(f, "placement_failed"),
            TaskEvent::AgentReported(state) => write!(f, "agent_reported({})", state),
            TaskEvent::KillRequested => write!(f, "kill_requested"),
            TaskEvent::TimeoutExpired => write!(f, "timeout_expired"),
            TaskEvent::AgentLost => write!(f, "agent_lost"),
        }
    }
}

/// Why an event was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The event has no meaning in the current state.
    NotApplicable { state: TaskState, event: TaskEvent },
    /// An agent reported a state at or behind the current one.
    Backward { current: TaskState, reported: TaskState },
    /// A kill was requested while one is already in flight.
    AlreadyKilling,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::NotApplicable { state, event } => {
                write!(f, "{} not applicable in state {}", event, state)
            }
            Rejection::Backward { current, reported } => {
                write!(f, "reported state {} does not advance {}", reported, current)
            }
            Rejection::AlreadyKilling => write!(f, "kill already initiated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state.
    Next(TaskState),
    /// The task is finished; the event is absorbed.
    Noop,
    Rejected(Rejection),
}

impl Transition {
    pub fn next_state(&self) -> Option<TaskState> {
        match self {
            Transition::Next(state) => Some(*state),
            _ => None,
        }
    }
}

pub fn transition(current: TaskState, event: TaskEvent) -> Transition {
    use TaskState::*;

    if current.is_terminal() {
        return Transition::Noop;
    }

    let not_applicable = Transition::Rejected(Rejection::NotApplicable {
        state: current,
        event,
    });

    match (current, event) {
        (_, TaskEvent::AgentLost) => Transition::Next(Finished(FinishReason::Lost)),

        (KillInitiated, TaskEvent::KillRequested) => {
            Transition::Rejected(Rejection::AlreadyKilling)
        }
        (_, TaskEvent::KillRequested) => Transition::Next(KillInitiated),

        (Accepted, TaskEvent::PlacementSucceeded) => Transition::Next(Launched),
        (Accepted, TaskEvent::PlacementFailed) => {
            Transition::Next(Finished(FinishReason::Failed))
        }
        (_, TaskEvent::PlacementSucceeded | TaskEvent::PlacementFailed) => not_applicable,

        (Launched | StartInitiated | KillInitiated, TaskEvent::TimeoutExpired) => {
            Transition::Next(Finished(FinishReason::TimedOut))
        }
        (_, TaskEvent::TimeoutExpired) => not_applicable,

        (Accepted, TaskEvent::AgentReported(_)) => not_applicable,
        (KillInitiated, TaskEvent::AgentReported(Finished(_))) => {
            Transition::Next(Finished(FinishReason::Killed))
        }
        (KillInitiated, TaskEvent::AgentReported(reported)) => {
            Transition::Rejected(Rejection::Backward { current, reported })
        }
        (Launched | StartInitiated | Started, TaskEvent::AgentReported(reported)) => {
            if current.precedes(&reported) {
                Transition::Next(reported)
            } else {
                Transition::Rejected(Rejection::Backward { current, reported })
            }
        }
        (Finished(_), _) => Transition::Noop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;

    #[test]
    fn placement_moves_accepted_to_launched() {
        assert_eq!(
            transition(Accepted, TaskEvent::PlacementSucceeded),
            Transition::Next(Launched)
        );
        assert_eq!(
            transition(Accepted, TaskEvent::PlacementFailed),
            Transition::Next(Finished(FinishReason::Failed))
        );
    }

    #[test]
    fn late_placement_is_rejected() {
        for state in [Launched, Started, KillInitiated] {
            assert!(matches!(
                transition(state, TaskEvent::PlacementSucceeded),
                Transition::Rejected(Rejection::NotApplicable { .. })
            ));
        }
    }

    #[test]
    fn agent_reports_only_move_forward() {
        assert_eq!(
            transition(Launched, TaskEvent::AgentReported(StartInitiated)),
            Transition::Next(StartInitiated)
        );
        assert_eq!(
            transition(Launched, TaskEvent::AgentReported(Started)),
            Transition::Next(Started)
        );
        assert_eq!(
            transition(Started, TaskEvent::AgentReported(StartInitiated)),
            Transition::Rejected(Rejection::Backward {
                current: Started,
                reported: StartInitiated
            })
        );
        assert!(matches!(
            transition(StartInitiated, TaskEvent::AgentReported(StartInitiated)),
            Transition::Rejected(Rejection::Backward { .. })
        ));
    }

    #[test]
    fn agent_reported_finish_keeps_reason() {
        assert_eq!(
            transition(
                Started,
                TaskEvent::AgentReported(Finished(FinishReason::Normal))
            ),
            Transition::Next(Finished(FinishReason::Normal))
        );
        assert_eq!(
            transition(
                Launched,
                TaskEvent::AgentReported(Finished(FinishReason::Failed))
            ),
            Transition::Next(Finished(FinishReason::Failed))
        );
    }

    #[test]
    fn reports_before_placement_are_rejected() {
        assert!(matches!(
            transition(Accepted, TaskEvent::AgentReported(Started)),
            Transition::Rejected(Rejection::NotApplicable { .. })
        ));
    }

    #[test]
    fn finish_during_kill_is_killed() {
        assert_eq!(
            transition(
                KillInitiated,
                TaskEvent::AgentReported(Finished(FinishReason::Normal))
            ),
            Transition::Next(Finished(FinishReason::Killed))
        );
        assert!(matches!(
            transition(KillInitiated, TaskEvent::AgentReported(Started)),
            Transition::Rejected(Rejection::Backward { .. })
        ));
    }

    #[test]
    fn kill_from_any_active_state() {
        for state in [Accepted, Launched, StartInitiated, Started] {
            assert_eq!(
                transition(state, TaskEvent::KillRequested),
                Transition::Next(KillInitiated),
                "from {}",
                state
            );
        }
        assert_eq!(
            transition(KillInitiated, TaskEvent::KillRequested),
            Transition::Rejected(Rejection::AlreadyKilling)
        );
    }

    #[test]
    fn timeouts_apply_to_timed_states_only() {
        for state in [Launched, StartInitiated, KillInitiated] {
            assert_eq!(
                transition(state, TaskEvent::TimeoutExpired),
                Transition::Next(Finished(FinishReason::TimedOut))
            );
        }
        for state in [Accepted, Started] {
            assert!(matches!(
                transition(state, TaskEvent::TimeoutExpired),
                Transition::Rejected(Rejection::NotApplicable { .. })
            ));
        }
    }

    #[test]
    fn agent_lost_from_every_active_state() {
        for state in TaskState::active_states() {
            assert_eq!(
                transition(state, TaskEvent::AgentLost),
                Transition::Next(Finished(FinishReason::Lost))
            );
        }
    }

    #[test]
    fn finished_absorbs_everything() {
        let done = Finished(FinishReason::Normal);
        for event in [
            TaskEvent::PlacementSucceeded,
            TaskEvent::AgentReported(Started),
            TaskEvent::KillRequested,
            TaskEvent::TimeoutExpired,
            TaskEvent::AgentLost,
        ] {
            assert_eq!(transition(done, event), Transition::Noop);
        }
    }

    #[test]
    fn applied_transitions_never_go_backward() {
        let events = [
            TaskEvent::PlacementSucceeded,
            TaskEvent::PlacementFailed,
            TaskEvent::AgentReported(Launched),
            TaskEvent::AgentReported(StartInitiated),
            TaskEvent::AgentReported(Started),
            TaskEvent::AgentReported(Finished(FinishReason::Normal)),
            TaskEvent::KillRequested,
            TaskEvent::TimeoutExpired,
            TaskEvent::AgentLost,
        ];
        for state in TaskState::active_states() {
            for event in events {
                if let Transition::Next(next) = transition(state, event) {
                    assert!(state.precedes(&next), "{} -> {} via {}", state, next, event);
                }
            }
        }
    }
}
