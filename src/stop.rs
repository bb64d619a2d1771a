//! Cooperative, reason-carrying stop flag shared by a mission's tasks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

/// Why a mission stopped before draining its backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// An operator asked for a graceful stop.
    Manual,
    /// The escalation table ran out for some unit.
    SystemicOutage(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Manual => write!(f, "stopped by operator"),
            StopReason::SystemicOutage(msg) => write!(f, "systemic outage: {msg}"),
        }
    }
}

/// Raised once; the first reason wins. Polled at loop boundaries and
/// awaited inside long sleeps.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` if this call raised the signal.
    pub fn raise(&self, reason: StopReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_raised(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.tx.borrow().clone()
    }

    /// Resolves once the signal is raised.
    pub async fn raised(&self) {
        let mut rx = self.tx.subscribe();
        rx.wait_for(Option::is_some).await.ok();
    }

    /// Sleeps for `duration` unless the signal is raised first.
    /// Returns `false` when the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_raised() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.raised() => false,
        }
    }
}
