//! Exclusive claiming of work units across concurrent workers.
//!
//! The claim set is the only concurrency guarantee: a unit id is claimed
//! inside one critical section with no suspension point, after any I/O
//! eligibility checks have already run. Two workers that both pass the I/O
//! checks for the same id are separated by that final gate.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::PayloadError;
use crate::state_machine::{WorkUnit, WorkUnitId, WorkerId};

/// Where work comes from and how eligibility is judged.
pub trait CandidateSource: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;

    /// A bounded page of candidates; order is not significant.
    fn scan_candidates(&self, page_size: usize)
    -> impl Future<Output = Result<Vec<WorkUnit>>> + Send;

    fn count_existing_output(&self, id: &WorkUnitId) -> impl Future<Output = Result<usize>> + Send;

    fn has_prerequisite(&self, id: &WorkUnitId) -> impl Future<Output = Result<bool>> + Send;

    /// Builds the request for a claimed unit.
    fn build_payload(
        &self,
        unit: &WorkUnit,
    ) -> impl Future<Output = Result<Self::Payload, PayloadError>> + Send;
}

/// Durable destination for generated outputs.
pub trait PersistenceSink<T>: Send + Sync + 'static {
    fn persist(&self, id: &WorkUnitId, output: &T) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Default)]
struct Ledger {
    claims: HashMap<WorkUnitId, WorkerId>,
    permanent: HashSet<WorkUnitId>,
    completed: HashSet<WorkUnitId>,
    /// Units whose output already existed when scanned.
    has_output: HashSet<WorkUnitId>,
}

impl Ledger {
    fn is_excluded(&self, id: &WorkUnitId) -> bool {
        self.claims.contains_key(id)
            || self.permanent.contains(id)
            || self.completed.contains(id)
            || self.has_output.contains(id)
    }

    fn excluded_count(&self) -> usize {
        self.claims.len() + self.permanent.len() + self.completed.len() + self.has_output.len()
    }
}

type SharedLedger = Arc<Mutex<Ledger>>;

fn lock(ledger: &SharedLedger) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive hold on one work unit. Dropping it releases the claim.
#[derive(Debug)]
pub struct Claim {
    unit: WorkUnit,
    worker: WorkerId,
    ledger: SharedLedger,
}

impl Claim {
    pub fn unit(&self) -> &WorkUnit {
        &self.unit
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Releases the claim and excludes the unit for the rest of the mission.
    pub fn abandon(self) {
        lock(&self.ledger).permanent.insert(self.unit.id.clone());
    }

    /// Releases the claim and records that the output has been persisted.
    pub fn complete(self) {
        lock(&self.ledger).completed.insert(self.unit.id.clone());
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut ledger = lock(&self.ledger);
        if ledger.claims.get(&self.unit.id) == Some(&self.worker) {
            ledger.claims.remove(&self.unit.id);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerSnapshot {
    pub claimed: Vec<WorkUnitId>,
    pub permanent_failures: Vec<WorkUnitId>,
    pub completed: usize,
}

/// Hands out the next eligible, unclaimed unit to a worker.
pub struct JobClaimCoordinator<S> {
    source: Arc<S>,
    ledger: SharedLedger,
    page_size: usize,
}

impl<S: CandidateSource> JobClaimCoordinator<S> {
    pub fn new(source: Arc<S>, page_size: usize) -> Self {
        Self {
            source,
            ledger: Arc::default(),
            page_size: page_size.max(1),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Claims the first eligible unit, or returns `None` once the backlog
    /// holds nothing this mission may still process.
    ///
    /// Units excluded during a pass shrink the useful part of the page, so a
    /// pass that excluded anything is followed by a wider one. `None` comes
    /// only from a pass that excluded nothing new or saw the whole backlog.
    pub async fn claim_next(&self, worker: WorkerId) -> Result<Option<Claim>> {
        loop {
            // Widen the page by everything we will skip anyway so excluded
            // units cannot crowd out fresh candidates.
            let page_size = self.page_size + lock(&self.ledger).excluded_count();
            let page = self
                .source
                .scan_candidates(page_size)
                .await
                .context("candidate scan failed")?;
            let whole_backlog = page.len() < page_size;
            let mut excluded_now = false;

            for unit in page {
                if lock(&self.ledger).is_excluded(&unit.id) {
                    continue;
                }

                let existing = self
                    .source
                    .count_existing_output(&unit.id)
                    .await
                    .with_context(|| format!("counting outputs for {}", unit.id))?;
                if existing > 0 {
                    debug!(unit = %unit.id, existing, "skipping unit that already has output");
                    lock(&self.ledger).has_output.insert(unit.id);
                    excluded_now = true;
                    continue;
                }

                let ready = self
                    .source
                    .has_prerequisite(&unit.id)
                    .await
                    .with_context(|| format!("checking prerequisite for {}", unit.id))?;
                if !ready {
                    warn!(unit = %unit.id, "prerequisite missing; excluded for this mission");
                    self.mark_permanent(&unit.id);
                    excluded_now = true;
                    continue;
                }

                match self.try_claim(unit, worker) {
                    Some(claim) => {
                        info!(worker = %worker, unit = %claim.unit.id, "claimed work unit");
                        return Ok(Some(claim));
                    }
                    // Another worker took it between the checks and the gate.
                    None => excluded_now = true,
                }
            }

            if whole_backlog || !excluded_now {
                return Ok(None);
            }
            debug!(worker = %worker, page_size, "page exhausted by new exclusions; rescanning");
        }
    }

    /// The synchronous gate: check-and-insert under one lock.
    pub fn try_claim(&self, unit: WorkUnit, worker: WorkerId) -> Option<Claim> {
        let mut ledger = lock(&self.ledger);
        if ledger.is_excluded(&unit.id) {
            debug!(worker = %worker, unit = %unit.id, "lost claim race");
            return None;
        }
        ledger.claims.insert(unit.id.clone(), worker);
        drop(ledger);

        Some(Claim {
            unit,
            worker,
            ledger: self.ledger.clone(),
        })
    }

    pub fn mark_permanent(&self, id: &WorkUnitId) {
        lock(&self.ledger).permanent.insert(id.clone());
    }

    pub fn is_claimed(&self, id: &WorkUnitId) -> bool {
        lock(&self.ledger).claims.contains_key(id)
    }

    pub fn is_permanent(&self, id: &WorkUnitId) -> bool {
        lock(&self.ledger).permanent.contains(id)
    }

    /// Forgets all session state. Called at mission start and end.
    pub fn clear(&self) {
        let mut ledger = lock(&self.ledger);
        ledger.claims.clear();
        ledger.permanent.clear();
        ledger.completed.clear();
        ledger.has_output.clear();
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let ledger = lock(&self.ledger);
        let mut claimed: Vec<_> = ledger.claims.keys().cloned().collect();
        let mut permanent_failures: Vec<_> = ledger.permanent.iter().cloned().collect();
        claimed.sort();
        permanent_failures.sort();
        LedgerSnapshot {
            claimed,
            permanent_failures,
            completed: ledger.completed.len(),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::testing::MemorySource;
    use super::*;

    fn coordinator(ids: &[&str], page: usize) -> Arc<JobClaimCoordinator<MemorySource>> {
        Arc::new(JobClaimCoordinator::new(
            Arc::new(MemorySource::with_units(ids)),
            page,
        ))
    }

    #[tokio::test]
    async fn claims_first_eligible_unit() {
        let coord = coordinator(&["a", "b"], 10);
        let claim = coord.claim_next(WorkerId(1)).await.unwrap().unwrap();
        assert_eq!(claim.unit().id.as_str(), "a");
        assert!(coord.is_claimed(&WorkUnitId::new("a")));
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_an_id() {
        let coord = coordinator(&["a", "b", "c"], 10);
        let (x, y) = tokio::join!(
            coord.claim_next(WorkerId(1)),
            coord.claim_next(WorkerId(2))
        );
        let x = x.unwrap().unwrap();
        let y = y.unwrap().unwrap();
        assert_ne!(x.unit().id, y.unit().id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_workers_claim_disjoint_units() {
        let ids: Vec<String> = (0..40).map(|i| format!("u{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let coord = coordinator(&refs, 5);

        let mut handles = Vec::new();
        for w in 0..8 {
            let coord = coord.clone();
            handles.push(tokio::spawn(async move {
                let mut held = Vec::new();
                while let Some(claim) = coord.claim_next(WorkerId(w)).await.unwrap() {
                    held.push(claim);
                }
                held.iter().map(|c| c.unit().id.clone()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "unit claimed twice");
            }
        }
        assert_eq!(total, 40);
    }

    #[tokio::test]
    async fn second_worker_gets_next_id_or_none() {
        let coord = coordinator(&["only"], 10);
        let (x, y) = tokio::join!(
            coord.claim_next(WorkerId(1)),
            coord.claim_next(WorkerId(2))
        );
        let got: Vec<_> = [x.unwrap(), y.unwrap()].into_iter().flatten().collect();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn release_on_drop_makes_unit_claimable_again() {
        let coord = coordinator(&["a"], 10);
        let claim = coord.claim_next(WorkerId(1)).await.unwrap().unwrap();
        assert!(coord.claim_next(WorkerId(2)).await.unwrap().is_none());
        drop(claim);
        let again = coord.claim_next(WorkerId(2)).await.unwrap().unwrap();
        assert_eq!(again.worker(), WorkerId(2));
    }

    #[tokio::test]
    async fn abandoned_units_are_never_reclaimed() {
        let coord = coordinator(&["a", "b"], 10);
        let claim = coord.claim_next(WorkerId(1)).await.unwrap().unwrap();
        assert_eq!(claim.unit().id.as_str(), "a");
        claim.abandon();

        assert!(coord.is_permanent(&WorkUnitId::new("a")));
        assert!(!coord.is_claimed(&WorkUnitId::new("a")));
        for _ in 0..3 {
            let next = coord.claim_next(WorkerId(2)).await.unwrap().unwrap();
            assert_eq!(next.unit().id.as_str(), "b");
        }
    }

    #[tokio::test]
    async fn completed_units_are_excluded_even_if_source_lags() {
        let coord = coordinator(&["a"], 10);
        coord.claim_next(WorkerId(1)).await.unwrap().unwrap().complete();
        assert!(coord.claim_next(WorkerId(1)).await.unwrap().is_none());
        assert_eq!(coord.snapshot().completed, 1);
    }

    #[tokio::test]
    async fn missing_prerequisite_is_marked_permanent_during_scan() {
        let source = MemorySource::with_units(&["b"]);
        source.add("a", None);
        let coord = JobClaimCoordinator::new(Arc::new(source), 10);

        let claim = coord.claim_next(WorkerId(1)).await.unwrap().unwrap();
        assert_eq!(claim.unit().id.as_str(), "b");
        assert!(coord.is_permanent(&WorkUnitId::new("a")));
    }

    #[tokio::test]
    async fn units_with_output_are_skipped() {
        let source = MemorySource::with_units(&["a", "b"]);
        source.outputs.lock().unwrap().insert(WorkUnitId::new("a"), 1);
        let coord = JobClaimCoordinator::new(Arc::new(source), 10);
        let claim = coord.claim_next(WorkerId(1)).await.unwrap().unwrap();
        assert_eq!(claim.unit().id.as_str(), "b");
    }

    #[tokio::test]
    async fn page_widens_by_excluded_units() {
        let coord = coordinator(&["a", "b", "c", "d"], 1);
        coord.mark_permanent(&WorkUnitId::new("a"));
        coord.mark_permanent(&WorkUnitId::new("b"));
        let claim = coord.claim_next(WorkerId(1)).await.unwrap().unwrap();
        assert_eq!(claim.unit().id.as_str(), "c");
        assert_eq!(*coord.source().scans.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn leading_units_without_prerequisite_do_not_hide_later_work() {
        let source = MemorySource::default();
        source.add("bare1", None);
        source.add("bare2", None);
        source.add("good", Some("prompt for good"));
        let coord = JobClaimCoordinator::new(Arc::new(source), 2);

        let claim = coord.claim_next(WorkerId(1)).await.unwrap().unwrap();
        assert_eq!(claim.unit().id.as_str(), "good");
        assert_eq!(*coord.source().scans.lock().unwrap(), vec![2, 4]);
    }

    #[tokio::test]
    async fn backlog_of_only_unready_units_ends_with_none() {
        let source = MemorySource::default();
        for id in ["x1", "x2", "x3"] {
            source.add(id, None);
        }
        let coord = JobClaimCoordinator::new(Arc::new(source), 1);

        assert!(coord.claim_next(WorkerId(1)).await.unwrap().is_none());
        assert_eq!(*coord.source().scans.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(coord.snapshot().permanent_failures.len(), 3);

        // A later call sees nothing new and stops after one pass.
        assert!(coord.claim_next(WorkerId(2)).await.unwrap().is_none());
        assert_eq!(coord.source().scans.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn clear_forgets_session_state() {
        let coord = coordinator(&["a"], 10);
        coord.mark_permanent(&WorkUnitId::new("a"));
        assert!(coord.claim_next(WorkerId(1)).await.unwrap().is_none());
        coord.clear();
        assert!(coord.claim_next(WorkerId(1)).await.unwrap().is_some());
    }

    #[test]
    fn stale_claim_drop_does_not_release_new_owner() {
        let coord = coordinator(&["a"], 10);
        let first = coord.try_claim(WorkUnit::new("a"), WorkerId(1)).unwrap();
        coord.clear();
        let second = coord.try_claim(WorkUnit::new("a"), WorkerId(2)).unwrap();
        drop(first);
        assert!(coord.is_claimed(&WorkUnitId::new("a")));
        drop(second);
        assert!(!coord.is_claimed(&WorkUnitId::new("a")));
    }
}
