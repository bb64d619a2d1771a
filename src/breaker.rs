//! Process-wide lockdown switch driven by consecutive critical failures.
//!
//! ```text
//! HEALTHY --(threshold consecutive critical failures)--> LOCKDOWN
//! LOCKDOWN --(critical success | successful probe | reset)--> HEALTHY
//! ```
//!
//! While locked, callers refuse to start new heavy work. The recovery probe
//! keeps running regardless, since it is what detects the end of an outage.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::pool::{FailoverInvoker, Invoker};
use crate::stop::StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerStatus {
    Healthy,
    Lockdown,
}

impl fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerStatus::Healthy => write!(f, "HEALTHY"),
            BreakerStatus::Lockdown => write!(f, "LOCKDOWN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerState {
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub lockdown_threshold: u32,
}

/// What a single recovery probe did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The breaker was healthy; nothing was sent.
    Skipped,
    /// Every credential is dead; nothing could be sent.
    NoCredential,
    Recovered,
    StillFailing(String),
}

pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    status_tx: watch::Sender<BreakerStatus>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(lockdown_threshold: u32) -> Self {
        let (status_tx, _rx) = watch::channel(BreakerStatus::Healthy);
        Self {
            state: Mutex::new(BreakerState {
                status: BreakerStatus::Healthy,
                consecutive_failures: 0,
                lockdown_threshold: lockdown_threshold.max(1),
            }),
            status_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> BreakerState {
        self.lock().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.lock().status == BreakerStatus::Lockdown
    }

    /// Counts one critical failure; flips to `LOCKDOWN` at the threshold.
    pub fn record_failure(&self) -> BreakerStatus {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.status == BreakerStatus::Healthy
            && state.consecutive_failures >= state.lockdown_threshold
        {
            state.status = BreakerStatus::Lockdown;
            warn!(
                failures = state.consecutive_failures,
                "circuit breaker entering LOCKDOWN; new work is paused until recovery"
            );
            self.status_tx.send_replace(BreakerStatus::Lockdown);
        }
        state.status
    }

    /// A critical operation succeeded: clear the counter and unlock.
    pub fn record_success(&self) {
        self.transition_healthy("critical operation succeeded");
    }

    /// Operator override, e.g. after provisioning fresh credentials.
    pub fn reset(&self) {
        self.transition_healthy("manual reset");
    }

    fn transition_healthy(&self, cause: &str) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        if state.status == BreakerStatus::Lockdown {
            state.status = BreakerStatus::Healthy;
            info!(cause, "circuit breaker back to HEALTHY");
            self.status_tx.send_replace(BreakerStatus::Healthy);
        }
    }

    /// Waits until the breaker is healthy. Returns `false` if `stop` fired first.
    pub async fn wait_until_healthy(&self, stop: &StopSignal) -> bool {
        let mut rx = self.status_tx.subscribe();
        tokio::select! {
            res = rx.wait_for(|s| *s == BreakerStatus::Healthy) => res.is_ok(),
            _ = stop.raised() => false,
        }
    }

    /// Sends one minimal request through a single credential, but only while locked.
    pub async fn probe_once<I: Invoker>(
        &self,
        failover: &FailoverInvoker<I>,
        limit: Duration,
    ) -> ProbeOutcome {
        if !self.is_locked() {
            return ProbeOutcome::Skipped;
        }
        let Some(credential) = failover.pool().acquire_any() else {
            warn!("recovery probe has no live credential to use");
            return ProbeOutcome::NoCredential;
        };

        let payload = failover.invoker().probe_payload();
        match failover.invoke_acquired(&credential, &payload, limit).await {
            Ok(_) => {
                info!(credential = %credential, "recovery probe succeeded");
                self.transition_healthy("recovery probe succeeded");
                ProbeOutcome::Recovered
            }
            Err(e) => {
                debug!(credential = %credential, error = %e, "recovery probe failed; staying in LOCKDOWN");
                ProbeOutcome::StillFailing(e.to_string())
            }
        }
    }
}

/// Probes every `every` while the breaker is locked, until `stop` fires.
pub async fn run_recovery_probe<I: Invoker>(
    failover: Arc<FailoverInvoker<I>>,
    every: Duration,
    limit: Duration,
    stop: StopSignal,
) {
    let breaker = failover.breaker().clone();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; a fresh lockdown should get a full interval.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if breaker.is_locked() {
                    breaker.probe_once(&failover, limit).await;
                }
            }
            _ = stop.raised() => break,
        }
    }
    debug!("recovery probe loop stopped");
}
