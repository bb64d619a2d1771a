use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::breaker::{BreakerState, run_recovery_probe};
use crate::coordinator::{CandidateSource, Claim, JobClaimCoordinator, LedgerSnapshot, PersistenceSink};
use crate::error::PayloadError;
use crate::pool::{CallOptions, CredentialSnapshot, FailoverInvoker, Invoker};
use crate::state_machine::{
    EscalationSchedule, FailureKind, StateMachine, Transition, UnitOutcome, UnitRecord, UnitRun,
    UnitState, WorkerId,
};
use crate::stop::{StopReason, StopSignal};

/// Consecutive candidate-scan failures after which a worker gives up.
const MAX_SCAN_ERRORS: u32 = 3;

#[derive(Debug, Clone)]
pub struct MissionConfig {
    pub workers: usize,
    pub page_size: usize,
    pub attempt_timeout: Duration,
    /// Added to the live pool size to form each sweep's attempt budget.
    pub attempt_margin: usize,
    pub unit_pause: Duration,
    pub escalation: EscalationSchedule,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            page_size: 20,
            attempt_timeout: Duration::from_secs(120),
            attempt_margin: 2,
            unit_pause: Duration::from_secs(1),
            escalation: EscalationSchedule::default(),
            probe_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionStart {
    Started,
    AlreadyRunning,
}

/// How a mission ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum MissionEnd {
    /// No eligible work was left.
    Drained,
    Stopped(StopReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionReport {
    pub mission_id: String,
    pub workers: usize,
    pub outcome: MissionEnd,
    pub units: Vec<UnitRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl MissionReport {
    fn count(&self, state: UnitState) -> usize {
        self.units.iter().filter(|u| u.state == state).count()
    }

    pub fn done(&self) -> usize {
        self.count(UnitState::Done)
    }

    pub fn abandoned(&self) -> usize {
        self.count(UnitState::Abandoned)
    }

    pub fn interrupted(&self) -> usize {
        self.count(UnitState::Interrupted)
    }
}

/// Live view for operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct MissionStatus {
    pub running: bool,
    pub breaker: BreakerState,
    pub ledger: LedgerSnapshot,
    pub done: usize,
    pub abandoned: usize,
    pub retries: usize,
    pub credentials: Vec<CredentialSnapshot>,
}

#[derive(Debug, Default)]
struct Counters {
    done: AtomicUsize,
    abandoned: AtomicUsize,
    retries: AtomicUsize,
}

impl Counters {
    fn reset(&self) {
        self.done.store(0, Ordering::Relaxed);
        self.abandoned.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct MissionContext<S, I: Invoker, K> {
    failover: Arc<FailoverInvoker<I>>,
    coordinator: JobClaimCoordinator<S>,
    sink: Arc<K>,
    config: MissionConfig,
    counters: Counters,
}

struct ActiveMission {
    stop: StopSignal,
    running: Arc<AtomicBool>,
    /// Taken by [`MissionOrchestrator::wait`].
    handle: Option<JoinHandle<MissionReport>>,
}

impl ActiveMission {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Clears the running flag when the mission task ends, panics included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the worker pool and exposes start/stop and breaker controls.
///
/// One instance per process; everything it shares with its workers is held
/// in fields rather than globals.
pub struct MissionOrchestrator<S, I: Invoker, K> {
    ctx: Arc<MissionContext<S, I, K>>,
    active: Mutex<Option<ActiveMission>>,
}

impl<S, I, K> MissionOrchestrator<S, I, K>
where
    I: Invoker,
    S: CandidateSource<Payload = I::Payload>,
    K: PersistenceSink<I::Output>,
{
    pub fn new(
        failover: Arc<FailoverInvoker<I>>,
        source: Arc<S>,
        sink: Arc<K>,
        mut config: MissionConfig,
    ) -> Self {
        config.workers = config.workers.max(1);
        let coordinator = JobClaimCoordinator::new(source, config.page_size);
        Self {
            ctx: Arc::new(MissionContext {
                failover,
                coordinator,
                sink,
                config,
                counters: Counters::default(),
            }),
            active: Mutex::new(None),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveMission>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the mission onto the current Tokio runtime and returns at once.
    pub fn start_mission(&self) -> MissionStart {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(ActiveMission::is_running) {
            return MissionStart::AlreadyRunning;
        }

        let stop = StopSignal::new();
        let running = Arc::new(AtomicBool::new(true));
        let guard = RunningGuard(running.clone());
        let mission = run_mission(self.ctx.clone(), stop.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            mission.await
        });
        *active = Some(ActiveMission {
            stop,
            running,
            handle: Some(handle),
        });
        MissionStart::Started
    }

    /// Requests a graceful stop. Returns whether a mission was running.
    pub fn stop_mission(&self) -> bool {
        let active = self.lock_active();
        match active.as_ref() {
            Some(a) if a.is_running() => {
                if a.stop.raise(StopReason::Manual) {
                    info!("mission stop requested");
                }
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(ActiveMission::is_running)
    }

    pub fn is_locked(&self) -> bool {
        self.ctx.failover.breaker().is_locked()
    }

    /// Forces the breaker back to healthy, e.g. after new keys were added.
    pub fn manual_reset(&self) {
        self.ctx.failover.breaker().reset();
    }

    /// Waits for the current mission and returns its report.
    /// `None` if no mission was started, its report was already taken,
    /// or its task panicked.
    pub async fn wait(&self) -> Option<MissionReport> {
        let handle = self.lock_active().as_mut()?.handle.take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "mission task failed");
                None
            }
        }
    }

    pub fn status(&self) -> MissionStatus {
        let counters = &self.ctx.counters;
        MissionStatus {
            running: self.is_running(),
            breaker: self.ctx.failover.breaker().state(),
            ledger: self.ctx.coordinator.snapshot(),
            done: counters.done.load(Ordering::Relaxed),
            abandoned: counters.abandoned.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            credentials: self.ctx.failover.pool().snapshot(),
        }
    }
}

async fn run_mission<S, I, K>(ctx: Arc<MissionContext<S, I, K>>, stop: StopSignal) -> MissionReport
where
    I: Invoker,
    S: CandidateSource<Payload = I::Payload>,
    K: PersistenceSink<I::Output>,
{
    let mission_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();
    ctx.coordinator.clear();
    ctx.counters.reset();
    info!(
        mission = %mission_id,
        workers = ctx.config.workers,
        credentials = ctx.failover.pool().count(),
        "mission started"
    );

    let probe_stop = StopSignal::new();
    let probe = tokio::spawn(run_recovery_probe(
        ctx.failover.clone(),
        ctx.config.probe_interval,
        ctx.config.probe_timeout,
        probe_stop.clone(),
    ));

    let mut workers = JoinSet::new();
    for n in 1..=ctx.config.workers {
        workers.spawn(worker_loop(ctx.clone(), WorkerId(n), stop.clone()));
    }

    let mut units = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(records) => units.extend(records),
            Err(e) => error!(mission = %mission_id, error = %e, "worker task failed"),
        }
    }

    probe_stop.raise(StopReason::Manual);
    if let Err(e) = probe.await {
        error!(mission = %mission_id, error = %e, "recovery probe task failed");
    }
    ctx.coordinator.clear();

    let outcome = match stop.reason() {
        Some(reason) => MissionEnd::Stopped(reason),
        None => MissionEnd::Drained,
    };
    let completed_at = Utc::now();
    let report = MissionReport {
        mission_id,
        workers: ctx.config.workers,
        outcome,
        units,
        started_at,
        completed_at,
        duration_ms: (completed_at - started_at).num_milliseconds(),
    };

    match &report.outcome {
        MissionEnd::Stopped(StopReason::SystemicOutage(msg)) => error!(
            mission = %report.mission_id,
            done = report.done(),
            reason = %msg,
            "mission halted by systemic outage"
        ),
        outcome => info!(
            mission = %report.mission_id,
            done = report.done(),
            abandoned = report.abandoned(),
            interrupted = report.interrupted(),
            outcome = ?outcome,
            "mission finished"
        ),
    }
    report
}

async fn worker_loop<S, I, K>(
    ctx: Arc<MissionContext<S, I, K>>,
    worker: WorkerId,
    stop: StopSignal,
) -> Vec<UnitRecord>
where
    I: Invoker,
    S: CandidateSource<Payload = I::Payload>,
    K: PersistenceSink<I::Output>,
{
    let breaker = ctx.failover.breaker().clone();
    let mut records = Vec::new();
    let mut scan_errors = 0;

    loop {
        if stop.is_raised() {
            break;
        }
        if breaker.is_locked() {
            info!(worker = %worker, "breaker in LOCKDOWN; pausing until recovery");
            if !breaker.wait_until_healthy(&stop).await {
                break;
            }
            info!(worker = %worker, "breaker healthy again; resuming");
        }

        let claim = match ctx.coordinator.claim_next(worker).await {
            Ok(Some(claim)) => {
                scan_errors = 0;
                claim
            }
            Ok(None) => {
                info!(worker = %worker, "no eligible work left");
                break;
            }
            Err(e) => {
                scan_errors += 1;
                warn!(worker = %worker, attempt = scan_errors, error = %format!("{e:#}"), "candidate scan failed");
                if scan_errors >= MAX_SCAN_ERRORS || !stop.sleep(ctx.config.unit_pause).await {
                    break;
                }
                continue;
            }
        };

        records.push(process_unit(&ctx, claim, &stop).await);

        if !stop.sleep(ctx.config.unit_pause).await {
            break;
        }
    }

    debug!(worker = %worker, processed = records.len(), "worker finished");
    records
}

/// Processes one claimed unit to a terminal state. Retries of the same unit
/// are strictly sequential and keep the claim for their whole duration.
async fn process_unit<S, I, K>(
    ctx: &MissionContext<S, I, K>,
    claim: Claim,
    stop: &StopSignal,
) -> UnitRecord
where
    I: Invoker,
    S: CandidateSource<Payload = I::Payload>,
    K: PersistenceSink<I::Output>,
{
    let worker = claim.worker();
    let mut run = UnitRun::new(claim.unit().clone(), worker, ctx.config.escalation.clone());

    let payload = match ctx.coordinator.source().build_payload(claim.unit()).await {
        Ok(payload) => payload,
        Err(e) => {
            let detail = match e {
                PayloadError::DataMissing(msg) => msg,
                PayloadError::Source(err) => format!("{err:#}"),
            };
            StateMachine::next(&mut run, UnitOutcome::Failed(FailureKind::DataMissing(detail)));
            warn!(worker = %worker, unit = %run.id(), "input missing; unit abandoned for this mission");
            Counters::bump(&ctx.counters.abandoned);
            claim.abandon();
            return UnitRecord::from_run(&run);
        }
    };

    let task = format!("generate:{}", run.id());
    loop {
        let budget = ctx.failover.pool().count() + ctx.config.attempt_margin;
        let options = CallOptions::new(ctx.config.attempt_timeout).max_attempts(budget);

        let outcome = match ctx.failover.invoke(&task, &payload, options).await {
            Ok(output) => match ctx.sink.persist(run.id(), &output).await {
                Ok(()) => UnitOutcome::Persisted,
                Err(e) => UnitOutcome::Failed(FailureKind::PersistFailed(format!("{e:#}"))),
            },
            Err(exhausted) => UnitOutcome::Failed(FailureKind::PoolExhausted(exhausted.to_string())),
        };

        match StateMachine::next(&mut run, outcome) {
            Transition::Complete(UnitState::Done) => {
                info!(worker = %worker, unit = %run.id(), sweeps = run.sweeps, "output persisted");
                Counters::bump(&ctx.counters.done);
                claim.complete();
                break;
            }
            Transition::Complete(state) => {
                error!(
                    worker = %worker,
                    unit = %run.id(),
                    state = %state,
                    error = ?run.last_failure,
                    "unit abandoned for this mission"
                );
                Counters::bump(&ctx.counters.abandoned);
                claim.abandon();
                break;
            }
            Transition::Retry { wait, level, reason } => {
                Counters::bump(&ctx.counters.retries);
                warn!(
                    worker = %worker,
                    unit = %run.id(),
                    level,
                    wait_secs = wait.as_secs(),
                    error = %reason,
                    "every credential failed; backing off before retrying the same unit"
                );
                if !stop.sleep(wait).await {
                    StateMachine::interrupt(&mut run);
                    info!(worker = %worker, unit = %run.id(), "stop requested during backoff; releasing unit");
                    break;
                }
                StateMachine::resume(&mut run);
            }
            Transition::Halt(reason) => {
                error!(
                    worker = %worker,
                    unit = %run.id(),
                    error = %reason,
                    "escalation schedule exhausted; stopping the mission"
                );
                stop.raise(StopReason::SystemicOutage(format!("{}: {reason}", run.id())));
                break;
            }
        }
    }

    UnitRecord::from_run(&run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::coordinator::testing::{MemorySink, MemorySource};
    use crate::error::InvokeError;
    use crate::pool::testing::{ScriptedInvoker, Step};
    use crate::pool::{CredentialPool, PoolPolicy};
    use crate::state_machine::WorkUnitId;

    type TestOrchestrator = MissionOrchestrator<MemorySource, ScriptedInvoker, MemorySink>;

    struct Harness {
        orch: TestOrchestrator,
        sink: Arc<MemorySink>,
        failover: Arc<FailoverInvoker<ScriptedInvoker>>,
    }

    fn config() -> MissionConfig {
        MissionConfig {
            workers: 2,
            page_size: 10,
            attempt_timeout: Duration::from_secs(5),
            attempt_margin: 0,
            unit_pause: Duration::ZERO,
            escalation: EscalationSchedule::from_secs(&[60, 120]),
            probe_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }

    fn harness(
        source: MemorySource,
        invoker: ScriptedInvoker,
        keys: &[&str],
        threshold: u32,
        config: MissionConfig,
    ) -> Harness {
        let pool = Arc::new(CredentialPool::new(keys, PoolPolicy::default()));
        let breaker = Arc::new(CircuitBreaker::new(threshold));
        let failover = Arc::new(FailoverInvoker::with_seed(invoker, pool, breaker, 11));
        let sink = Arc::new(MemorySink::default());
        let orch = MissionOrchestrator::new(failover.clone(), Arc::new(source), sink.clone(), config);
        Harness {
            orch,
            sink,
            failover,
        }
    }

    fn network() -> Step {
        Step::Fail(InvokeError::Network("connection reset".into()))
    }

    #[tokio::test]
    async fn mission_drains_backlog() {
        let h = harness(
            MemorySource::with_units(&["a", "b", "c", "d", "e"]),
            ScriptedInvoker::always(Step::Ok),
            &["k1", "k2", "k3"],
            3,
            config(),
        );

        assert_eq!(h.orch.start_mission(), MissionStart::Started);
        let report = h.orch.wait().await.unwrap();

        assert_eq!(report.outcome, MissionEnd::Drained);
        assert_eq!(report.done(), 5);
        for id in ["a", "b", "c", "d", "e"] {
            assert_eq!(h.sink.persist_count(id), 1);
        }
        let status = h.orch.status();
        assert!(status.ledger.claimed.is_empty());
        assert!(!status.running);
        assert_eq!(status.done, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn persist_is_called_at_most_once_per_unit() {
        let ids: Vec<String> = (0..30).map(|i| format!("u{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let h = harness(
            MemorySource::with_units(&refs),
            ScriptedInvoker::always(Step::Ok),
            &["k1", "k2"],
            3,
            MissionConfig {
                workers: 4,
                page_size: 3,
                ..config()
            },
        );

        h.orch.start_mission();
        let report = h.orch.wait().await.unwrap();
        assert_eq!(report.done(), 30);
        for id in &refs {
            assert_eq!(h.sink.persist_count(id), 1, "{id} persisted more than once");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_escalates_then_stops_mission() {
        let h = harness(
            MemorySource::with_units(&["only"]),
            ScriptedInvoker::always(network()),
            &["k1", "k2"],
            10,
            MissionConfig {
                workers: 1,
                ..config()
            },
        );

        let start = tokio::time::Instant::now();
        h.orch.start_mission();

        // Mid-backoff the unit stays claimed.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let status = h.orch.status();
        assert_eq!(status.ledger.claimed, vec![WorkUnitId::new("only")]);
        assert!(status.ledger.permanent_failures.is_empty());
        assert_eq!(status.retries, 1);

        let report = h.orch.wait().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(180));
        assert!(matches!(
            report.outcome,
            MissionEnd::Stopped(StopReason::SystemicOutage(_))
        ));
        let unit = &report.units[0];
        assert_eq!(unit.sweeps, 3);
        assert_eq!(unit.escalation_level, 2);
        assert_eq!(unit.state, UnitState::Interrupted);
        // Two keys, margin zero: two attempts per sweep.
        assert_eq!(h.failover.invoker().calls().len(), 6);
        assert_eq!(h.sink.persist_count("only"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_backoff_can_succeed() {
        let invoker = ScriptedInvoker::default().script("k1", vec![network(), Step::Ok]);
        let h = harness(
            MemorySource::with_units(&["a"]),
            invoker,
            &["k1"],
            10,
            MissionConfig {
                workers: 1,
                ..config()
            },
        );

        let start = tokio::time::Instant::now();
        h.orch.start_mission();
        let report = h.orch.wait().await.unwrap();

        assert_eq!(report.outcome, MissionEnd::Drained);
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(report.units[0].state, UnitState::Done);
        assert_eq!(report.units[0].escalation_level, 1);
        assert_eq!(
            report.units[0].state_transitions,
            vec![
                UnitState::Processing,
                UnitState::Waiting,
                UnitState::Processing,
                UnitState::Done
            ]
        );
        assert_eq!(h.sink.persist_count("a"), 1);
    }

    #[tokio::test]
    async fn permanent_failures_are_never_retried() {
        let source = MemorySource::with_units(&["good", "lost"]);
        source.add("bare", None);
        source.break_payload("lost");
        let h = harness(source, ScriptedInvoker::always(Step::Ok), &["k1"], 3, config());

        h.orch.start_mission();
        let report = h.orch.wait().await.unwrap();

        assert_eq!(report.done(), 1);
        assert_eq!(report.abandoned(), 1);
        let lost: Vec<_> = report
            .units
            .iter()
            .filter(|u| u.unit_id.as_str() == "lost")
            .collect();
        assert_eq!(lost.len(), 1);
        assert!(lost[0].last_failure.as_deref().unwrap().starts_with("Data missing"));
        // "bare" never got claimed; only "good" reached the invoker.
        assert_eq!(h.failover.invoker().calls().len(), 1);
        assert_eq!(h.sink.persist_count("lost"), 0);
        assert_eq!(h.sink.persist_count("bare"), 0);
    }

    #[tokio::test]
    async fn unready_units_filling_the_first_page_do_not_drain_mission() {
        let source = MemorySource::default();
        source.add("bare1", None);
        source.add("bare2", None);
        source.add("good", Some("prompt for good"));
        let h = harness(
            source,
            ScriptedInvoker::always(Step::Ok),
            &["k1"],
            3,
            MissionConfig {
                workers: 2,
                page_size: 2,
                ..config()
            },
        );

        h.orch.start_mission();
        let report = h.orch.wait().await.unwrap();
        assert_eq!(report.outcome, MissionEnd::Drained);
        assert_eq!(report.done(), 1);
        assert_eq!(h.sink.persist_count("good"), 1);
    }

    #[tokio::test]
    async fn persist_failure_abandons_unit() {
        let h = harness(
            MemorySource::with_units(&["a", "b"]),
            ScriptedInvoker::always(Step::Ok),
            &["k1"],
            3,
            config(),
        );
        h.sink.fail_on.lock().unwrap().insert(WorkUnitId::new("a"));

        h.orch.start_mission();
        let report = h.orch.wait().await.unwrap();
        assert_eq!(report.done(), 1);
        assert_eq!(report.abandoned(), 1);
        assert_eq!(h.failover.invoker().calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_interrupts_backoff() {
        let h = harness(
            MemorySource::with_units(&["a"]),
            ScriptedInvoker::always(network()),
            &["k1"],
            10,
            MissionConfig {
                workers: 1,
                escalation: EscalationSchedule::from_secs(&[3600]),
                ..config()
            },
        );

        h.orch.start_mission();
        assert_eq!(h.orch.start_mission(), MissionStart::AlreadyRunning);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.orch.is_running());
        assert!(h.orch.stop_mission());

        let report = h.orch.wait().await.unwrap();
        assert_eq!(report.outcome, MissionEnd::Stopped(StopReason::Manual));
        assert_eq!(report.interrupted(), 1);
        assert!(!h.orch.stop_mission());
        assert!(h.orch.status().ledger.claimed.is_empty());
    }

    #[tokio::test]
    async fn stop_without_mission_returns_false() {
        let h = harness(
            MemorySource::default(),
            ScriptedInvoker::always(Step::Ok),
            &["k1"],
            3,
            config(),
        );
        assert!(!h.orch.stop_mission());
        assert!(h.orch.wait().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lockdown_pauses_new_work_until_probe_recovers() {
        let h = harness(
            MemorySource::with_units(&["a", "b"]),
            ScriptedInvoker::always(network()),
            &["k1"],
            1,
            config(),
        );
        h.failover.breaker().record_failure();
        assert!(h.orch.is_locked());

        h.orch.start_mission();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.failover.invoker().calls().is_empty());

        // First probe at 60s fails; make the second one succeed.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(h.failover.invoker().calls(), vec!["k1".to_string()]);
        assert!(h.orch.is_locked());
        h.failover.invoker().set_fallback(Step::Ok);

        let report = h.orch.wait().await.unwrap();
        assert!(!h.orch.is_locked());
        assert_eq!(report.done(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reset_releases_paused_workers() {
        let h = harness(
            MemorySource::with_units(&["a"]),
            ScriptedInvoker::always(Step::Ok),
            &["k1"],
            1,
            MissionConfig {
                probe_interval: Duration::from_secs(3600),
                ..config()
            },
        );
        h.failover.breaker().record_failure();

        h.orch.start_mission();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.orch.status().done, 0);

        h.orch.manual_reset();
        let report = h.orch.wait().await.unwrap();
        assert_eq!(report.done(), 1);
    }

    #[tokio::test]
    async fn mission_can_be_restarted_with_fresh_session_state() {
        let source = MemorySource::with_units(&["a"]);
        source.break_payload("a");
        let h = harness(source, ScriptedInvoker::always(Step::Ok), &["k1"], 3, config());

        h.orch.start_mission();
        let first = h.orch.wait().await.unwrap();
        assert_eq!(first.abandoned(), 1);
        assert!(h.orch.status().ledger.permanent_failures.is_empty());

        h.orch.start_mission();
        let second = h.orch.wait().await.unwrap();
        assert_eq!(second.abandoned(), 1);
        assert_ne!(first.mission_id, second.mission_id);
    }
}
