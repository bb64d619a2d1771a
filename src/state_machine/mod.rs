mod job;
mod retry;
mod state;

pub use job::{
    FailureKind, UnitOutcome, UnitRecord, UnitRun, WorkUnit, WorkUnitId, WorkerId,
};
pub use retry::{EscalationSchedule, RetryState};
pub use state::{StateMachine, Transition, UnitState};
