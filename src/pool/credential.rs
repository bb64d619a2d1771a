use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::InvokeError;

/// Position of a credential inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CredentialId(usize);

impl CredentialId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One upstream API key. Cheap to clone; the secret is shared.
///
/// `Debug` and `Display` only ever show the label, never the secret.
#[derive(Clone)]
pub struct Credential {
    id: CredentialId,
    secret: Arc<str>,
    label: String,
}

impl Credential {
    fn new(index: usize, secret: &str) -> Self {
        let tail: String = secret
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Self {
            id: CredentialId(index),
            secret: Arc::from(secret),
            label: format!("key#{} (…{tail})", index + 1),
        }
    }

    pub fn id(&self) -> CredentialId {
        self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    RateLimited,
    Dead,
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialStatus::Active => write!(f, "active"),
            CredentialStatus::RateLimited => write!(f, "rate_limited"),
            CredentialStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Upper bound on a rate-limit cooldown, whatever the provider asks for.
pub const MAX_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(3600);

/// Tuning knobs for credential health tracking.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    /// Consecutive auth/quota failures after which a credential is retired.
    pub dead_after_failures: u32,
    /// Cooldown applied to a rate-limited credential when the provider gave no hint.
    pub rate_limit_cooldown: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            dead_after_failures: 3,
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct Health {
    status: CredentialStatus,
    consecutive_failures: u32,
    last_used_seq: u64,
    last_used_at: Option<DateTime<Utc>>,
    cooldown_until: Option<Instant>,
}

impl Health {
    fn new() -> Self {
        Self {
            status: CredentialStatus::Active,
            consecutive_failures: 0,
            last_used_seq: 0,
            last_used_at: None,
            cooldown_until: None,
        }
    }

    fn is_cooling(&self, now: Instant) -> bool {
        self.status == CredentialStatus::RateLimited
            && self.cooldown_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug)]
struct PoolState {
    health: Vec<Health>,
    use_counter: u64,
}

/// Point-in-time view of one credential, safe to print.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub label: String,
    pub status: CredentialStatus,
    pub consecutive_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A fixed set of interchangeable credentials with live health tracking.
///
/// Credentials are never removed; a retired one stays in the pool as `Dead`
/// for the rest of the process.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    state: Mutex<PoolState>,
    policy: PoolPolicy,
}

impl CredentialPool {
    /// Builds a pool from raw secrets. Blank and duplicate secrets are dropped.
    pub fn new<I, S>(secrets: I, policy: PoolPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen: Vec<String> = Vec::new();
        for secret in secrets {
            let secret = secret.as_ref().trim();
            if !secret.is_empty() && !seen.iter().any(|s| s == secret) {
                seen.push(secret.to_string());
            }
        }

        let credentials: Vec<Credential> = seen
            .iter()
            .enumerate()
            .map(|(i, s)| Credential::new(i, s))
            .collect();
        let health = credentials.iter().map(|_| Health::new()).collect();

        Self {
            credentials,
            state: Mutex::new(PoolState {
                health,
                use_counter: 0,
            }),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total number of credentials, dead ones included.
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Number of credentials that are not dead.
    pub fn count(&self) -> usize {
        self.lock()
            .health
            .iter()
            .filter(|h| h.status != CredentialStatus::Dead)
            .count()
    }

    /// Every non-dead credential, in pool order.
    pub fn live(&self) -> Vec<Credential> {
        let state = self.lock();
        self.credentials
            .iter()
            .zip(state.health.iter())
            .filter(|(_, h)| h.status != CredentialStatus::Dead)
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn is_usable(&self, credential: &Credential) -> bool {
        self.lock()
            .health
            .get(credential.id.0)
            .is_some_and(|h| h.status != CredentialStatus::Dead)
    }

    pub fn status(&self, credential: &Credential) -> Option<CredentialStatus> {
        self.lock().health.get(credential.id.0).map(|h| h.status)
    }

    /// Returns a live credential, or `None` when every credential is dead.
    ///
    /// Credentials that are not cooling down after a rate limit win; among
    /// those the least recently used is picked. A cooling credential is
    /// handed out only when nothing else is live, choosing the one whose
    /// cooldown ends first.
    pub fn acquire_any(&self) -> Option<Credential> {
        let now = Instant::now();
        let mut state = self.lock();

        let ready = state
            .health
            .iter()
            .enumerate()
            .filter(|(_, h)| h.status != CredentialStatus::Dead && !h.is_cooling(now))
            .min_by_key(|(_, h)| h.last_used_seq)
            .map(|(i, _)| i);

        let index = ready.or_else(|| {
            state
                .health
                .iter()
                .enumerate()
                .filter(|(_, h)| h.status != CredentialStatus::Dead)
                .min_by_key(|(_, h)| h.cooldown_until)
                .map(|(i, _)| i)
        })?;

        Self::touch(&mut state, index);
        Some(self.credentials[index].clone())
    }

    /// Records that `credential` is about to be used.
    pub fn mark_used(&self, credential: &Credential) {
        let mut state = self.lock();
        if credential.id.0 < state.health.len() {
            Self::touch(&mut state, credential.id.0);
        }
    }

    fn touch(state: &mut PoolState, index: usize) {
        state.use_counter += 1;
        let seq = state.use_counter;
        let health = &mut state.health[index];
        health.last_used_seq = seq;
        health.last_used_at = Some(Utc::now());
    }

    pub fn report_success(&self, credential: &Credential) {
        let mut state = self.lock();
        let Some(health) = state.health.get_mut(credential.id.0) else {
            return;
        };
        health.consecutive_failures = 0;
        if health.status == CredentialStatus::RateLimited {
            health.status = CredentialStatus::Active;
            health.cooldown_until = None;
            info!(credential = %credential, "credential recovered from rate limit");
        }
    }

    pub fn report_failure(&self, credential: &Credential, reason: &InvokeError) {
        let mut state = self.lock();
        let Some(health) = state.health.get_mut(credential.id.0) else {
            return;
        };
        if health.status == CredentialStatus::Dead {
            return;
        }
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);

        match reason {
            e if e.is_credential_fatal() => {
                if health.consecutive_failures >= self.policy.dead_after_failures {
                    health.status = CredentialStatus::Dead;
                    health.cooldown_until = None;
                    warn!(
                        credential = %credential,
                        failures = health.consecutive_failures,
                        error = %reason,
                        "credential retired for the rest of the process"
                    );
                } else {
                    debug!(credential = %credential, error = %reason, "credential rejected");
                }
            }
            InvokeError::RateLimited { retry_after } => {
                let cooldown = retry_after
                    .unwrap_or(self.policy.rate_limit_cooldown)
                    .min(MAX_RATE_LIMIT_COOLDOWN);
                let now = Instant::now();
                health.status = CredentialStatus::RateLimited;
                health.cooldown_until = Some(now.checked_add(cooldown).unwrap_or(now));
                info!(
                    credential = %credential,
                    cooldown_secs = cooldown.as_secs(),
                    "credential rate limited"
                );
            }
            _ => {
                debug!(credential = %credential, error = %reason, "credential attempt failed");
            }
        }
    }

    pub fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let state = self.lock();
        self.credentials
            .iter()
            .zip(state.health.iter())
            .map(|(c, h)| CredentialSnapshot {
                label: c.label.clone(),
                status: h.status,
                consecutive_failures: h.consecutive_failures,
                last_used_at: h.last_used_at,
            })
            .collect()
    }
}
