use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::retry::{EscalationSchedule, RetryState};
use super::state::UnitState;

/// Stable identifier of a work unit, owned by the candidate source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkUnitId(String);

impl WorkUnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkUnitId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for WorkUnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A reference to one item of work. The core never owns the item itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: WorkUnitId,
}

impl WorkUnit {
    pub fn new(id: impl Into<WorkUnitId>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Why processing a unit did not produce a persisted output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Required upstream input is absent. Permanent for the mission.
    DataMissing(String),
    /// Every credential failed. Escalates through the retry schedule.
    PoolExhausted(String),
    /// Output was generated but could not be stored. Permanent for the mission.
    PersistFailed(String),
}

impl FailureKind {
    pub fn is_permanent(&self) -> bool {
        !matches!(self, FailureKind::PoolExhausted(_))
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::DataMissing(msg) => write!(f, "Data missing: {msg}"),
            FailureKind::PoolExhausted(msg) => write!(f, "Pool exhausted: {msg}"),
            FailureKind::PersistFailed(msg) => write!(f, "Persist failed: {msg}"),
        }
    }
}

/// The result of one full processing sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Persisted,
    Failed(FailureKind),
}

/// A claimed unit being processed by one worker.
#[derive(Debug, Clone)]
pub struct UnitRun {
    pub unit: WorkUnit,
    pub worker: WorkerId,
    pub state: UnitState,
    pub state_history: Vec<UnitState>,
    pub sweeps: u32,
    pub retry: RetryState,
    pub last_failure: Option<FailureKind>,
    pub started_at: DateTime<Utc>,
}

impl UnitRun {
    pub fn new(unit: WorkUnit, worker: WorkerId, schedule: EscalationSchedule) -> Self {
        Self {
            unit,
            worker,
            state: UnitState::Processing,
            state_history: Vec::new(),
            sweeps: 0,
            retry: RetryState::new(schedule),
            last_failure: None,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &WorkUnitId {
        &self.unit.id
    }
}

/// Per-unit audit entry produced when processing ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRecord {
    pub unit_id: WorkUnitId,
    pub worker: WorkerId,
    pub state: UnitState,
    pub state_transitions: Vec<UnitState>,
    pub sweeps: u32,
    pub escalation_level: usize,
    pub last_failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl UnitRecord {
    pub fn from_run(run: &UnitRun) -> Self {
        let now = Utc::now();
        let mut transitions = run.state_history.clone();
        transitions.push(run.state);

        Self {
            unit_id: run.unit.id.clone(),
            worker: run.worker,
            state: run.state,
            state_transitions: transitions,
            sweeps: run.sweeps,
            escalation_level: run.retry.level(),
            last_failure: run.last_failure.as_ref().map(ToString::to_string),
            started_at: run.started_at,
            completed_at: now,
            duration_ms: (now - run.started_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_run_defaults() {
        let run = UnitRun::new(WorkUnit::new("u-1"), WorkerId(1), EscalationSchedule::default());
        assert_eq!(run.state, UnitState::Processing);
        assert_eq!(run.sweeps, 0);
        assert_eq!(run.retry.level(), 0);
        assert!(run.state_history.is_empty());
        assert_eq!(run.id().as_str(), "u-1");
    }

    #[test]
    fn record_from_run() {
        let run = UnitRun::new(WorkUnit::new("u-2"), WorkerId(2), EscalationSchedule::default());
        let record = UnitRecord::from_run(&run);
        assert_eq!(record.unit_id, WorkUnitId::new("u-2"));
        assert_eq!(record.worker, WorkerId(2));
        assert_eq!(record.state_transitions, vec![UnitState::Processing]);
        assert!(record.last_failure.is_none());
    }

    #[test]
    fn failure_kind_display_and_permanence() {
        let missing = FailureKind::DataMissing("no prompt".into());
        assert_eq!(missing.to_string(), "Data missing: no prompt");
        assert!(missing.is_permanent());

        let exhausted = FailureKind::PoolExhausted("3 attempts".into());
        assert_eq!(exhausted.to_string(), "Pool exhausted: 3 attempts");
        assert!(!exhausted.is_permanent());

        assert!(FailureKind::PersistFailed("disk full".into()).is_permanent());
    }

    #[test]
    fn ids_serialize_transparently() {
        let unit = WorkUnit::new("chapter-7");
        let json = serde_json::to_string(&unit).unwrap();
        assert_eq!(json, r#"{"id":"chapter-7"}"#);
        assert_eq!(WorkerId(3).to_string(), "worker-3");
    }
}
