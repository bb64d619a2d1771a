use std::sync::Arc;
use std::time::Duration;

/// Ascending waits applied after successive pool exhaustions of one unit.
///
/// Default: 1 min, 2 min, 10 min, 30 min, 1 h, 2 h, 4 h.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationSchedule {
    steps: Arc<[Duration]>,
}

impl Default for EscalationSchedule {
    fn default() -> Self {
        Self::from_secs(&[60, 120, 600, 1800, 3600, 7200, 14400])
    }
}

impl EscalationSchedule {
    pub fn new(steps: Vec<Duration>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, level: usize) -> Option<Duration> {
        self.steps.get(level).copied()
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}

/// Where one in-flight unit currently sits in the escalation table.
/// Starts at level 0 on claim and is dropped with the claim.
#[derive(Debug, Clone)]
pub struct RetryState {
    schedule: EscalationSchedule,
    level: usize,
}

impl RetryState {
    pub fn new(schedule: EscalationSchedule) -> Self {
        Self { schedule, level: 0 }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// The wait the next exhaustion would cost, without consuming it.
    pub fn next_wait(&self) -> Option<Duration> {
        self.schedule.get(self.level)
    }

    /// Consumes one level. `None` means the table is exhausted.
    pub fn escalate(&mut self) -> Option<Duration> {
        let wait = self.schedule.get(self.level)?;
        self.level += 1;
        Some(wait)
    }

    pub fn is_exhausted(&self) -> bool {
        self.level >= self.schedule.len()
    }
}
