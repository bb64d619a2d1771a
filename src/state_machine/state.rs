use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::job::{FailureKind, UnitOutcome, UnitRun};

/// Lifecycle of one claimed work unit.
///
/// PROCESSING → DONE | ABANDONED, or PROCESSING → WAITING → PROCESSING
/// after a pool exhaustion. INTERRUPTED covers a mission stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    Processing,
    Waiting,
    Done,
    Abandoned,
    Interrupted,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitState::Done | UnitState::Abandoned | UnitState::Interrupted
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Processing => write!(f, "PROCESSING"),
            UnitState::Waiting => write!(f, "WAITING"),
            UnitState::Done => write!(f, "DONE"),
            UnitState::Abandoned => write!(f, "ABANDONED"),
            UnitState::Interrupted => write!(f, "INTERRUPTED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The unit reached a terminal state.
    Complete(UnitState),
    /// Sleep for `wait`, then process the same unit again.
    Retry {
        wait: Duration,
        level: usize,
        reason: FailureKind,
    },
    /// The escalation table is exhausted: the whole mission must stop.
    Halt(FailureKind),
}

pub struct StateMachine;

impl StateMachine {
    /// Applies one sweep outcome to a processing unit.
    ///
    /// - `Persisted` → `DONE`.
    /// - A permanent failure → `ABANDONED`.
    /// - Pool exhaustion → `WAITING` with the next escalation wait, or
    ///   `Halt` once the table has been used up.
    ///
    /// Terminal units are left untouched.
    pub fn next(run: &mut UnitRun, outcome: UnitOutcome) -> Transition {
        if run.state.is_terminal() {
            return Transition::Complete(run.state);
        }
        run.sweeps += 1;

        let transition = match outcome {
            UnitOutcome::Persisted => Transition::Complete(UnitState::Done),
            UnitOutcome::Failed(kind) if kind.is_permanent() => {
                run.last_failure = Some(kind);
                Transition::Complete(UnitState::Abandoned)
            }
            UnitOutcome::Failed(kind) => {
                run.last_failure = Some(kind.clone());
                match run.retry.escalate() {
                    Some(wait) => Transition::Retry {
                        wait,
                        level: run.retry.level(),
                        reason: kind,
                    },
                    None => Transition::Halt(kind),
                }
            }
        };

        let next_state = match &transition {
            Transition::Complete(state) => *state,
            Transition::Retry { .. } => UnitState::Waiting,
            Transition::Halt(_) => UnitState::Interrupted,
        };
        Self::enter(run, next_state);
        transition
    }

    /// WAITING → PROCESSING after the escalation sleep.
    pub fn resume(run: &mut UnitRun) {
        if run.state == UnitState::Waiting {
            Self::enter(run, UnitState::Processing);
        }
    }

    /// Releases a non-terminal unit because the mission is stopping.
    pub fn interrupt(run: &mut UnitRun) {
        if !run.state.is_terminal() {
            Self::enter(run, UnitState::Interrupted);
        }
    }

    fn enter(run: &mut UnitRun, state: UnitState) {
        run.state_history.push(run.state);
        run.state = state;
    }
}
