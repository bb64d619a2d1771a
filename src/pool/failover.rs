use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::credential::{Credential, CredentialPool};
use crate::breaker::CircuitBreaker;
use crate::error::{InvokeError, PoolExhausted};

/// The raw upstream call: one credential, one payload, one classified result.
pub trait Invoker: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;
    type Output: Send + Sync + 'static;

    fn invoke(
        &self,
        credential: &Credential,
        payload: &Self::Payload,
    ) -> impl Future<Output = Result<Self::Output, InvokeError>> + Send;

    /// The cheapest request that still proves a credential works end to end.
    fn probe_payload(&self) -> Self::Payload;
}

/// Per-call knobs for [`FailoverInvoker::invoke`].
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    /// Deadline for each individual attempt.
    pub timeout: Duration,
    /// Attempt budget; `None` means one attempt per live credential.
    pub max_attempts: Option<usize>,
    /// Whether the outcome feeds the circuit breaker.
    pub critical: bool,
}

impl CallOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_attempts: None,
            critical: true,
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }
}

/// Runs one logical call against the whole pool, failing over between
/// credentials in a freshly shuffled order each time.
pub struct FailoverInvoker<I: Invoker> {
    invoker: I,
    pool: Arc<CredentialPool>,
    breaker: Arc<CircuitBreaker>,
    rng: Mutex<StdRng>,
}

impl<I: Invoker> FailoverInvoker<I> {
    pub fn new(invoker: I, pool: Arc<CredentialPool>, breaker: Arc<CircuitBreaker>) -> Self {
        Self::with_rng(invoker, pool, breaker, StdRng::from_os_rng())
    }

    /// Deterministic attempt ordering, for tests and reproducible runs.
    pub fn with_seed(
        invoker: I,
        pool: Arc<CredentialPool>,
        breaker: Arc<CircuitBreaker>,
        seed: u64,
    ) -> Self {
        Self::with_rng(invoker, pool, breaker, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        invoker: I,
        pool: Arc<CredentialPool>,
        breaker: Arc<CircuitBreaker>,
        rng: StdRng,
    ) -> Self {
        Self {
            invoker,
            pool,
            breaker,
            rng: Mutex::new(rng),
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// A shuffled permutation of the live credentials, cycled to fill
    /// `max_attempts` when the budget exceeds the pool.
    pub fn attempt_order(&self, max_attempts: Option<usize>) -> Vec<Credential> {
        let mut live = self.pool.live();
        if live.is_empty() {
            return live;
        }
        {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            live.shuffle(&mut *rng);
        }
        let budget = max_attempts.unwrap_or(live.len());
        live.iter().cycle().take(budget).cloned().collect()
    }

    /// Tries credentials until one succeeds or the attempt budget runs out.
    ///
    /// Transient failures never escape this function; the caller only sees
    /// the first success or a [`PoolExhausted`] carrying the last error.
    pub async fn invoke(
        &self,
        task: &str,
        payload: &I::Payload,
        options: CallOptions,
    ) -> Result<I::Output, PoolExhausted> {
        let order = self.attempt_order(options.max_attempts);
        let mut attempts = 0;
        let mut last_error = None;

        for credential in &order {
            // A credential can die mid-call while another worker is using it.
            if !self.pool.is_usable(credential) {
                continue;
            }
            attempts += 1;
            self.pool.mark_used(credential);

            match self.attempt(credential, payload, options.timeout).await {
                Ok(output) => {
                    debug!(task, credential = %credential, attempts, "invocation succeeded");
                    if options.critical {
                        self.breaker.record_success();
                    }
                    return Ok(output);
                }
                Err(e) => {
                    debug!(task, credential = %credential, attempt = attempts, error = %e, "attempt failed, failing over");
                    last_error = Some(e);
                }
            }
        }

        let exhausted = PoolExhausted {
            task: task.to_string(),
            attempts,
            last_error,
        };
        warn!(task, attempts, error = %exhausted, "credential pool exhausted");
        if options.critical {
            self.breaker.record_failure();
        }
        Err(exhausted)
    }

    /// A single timed attempt with one specific credential, reported to the pool.
    pub async fn invoke_with(
        &self,
        credential: &Credential,
        payload: &I::Payload,
        limit: Duration,
    ) -> Result<I::Output, InvokeError> {
        self.pool.mark_used(credential);
        self.attempt(credential, payload, limit).await
    }

    /// Like [`invoke_with`](Self::invoke_with) for a credential the caller
    /// just took from [`CredentialPool::acquire_any`], which already
    /// recorded the use.
    pub async fn invoke_acquired(
        &self,
        credential: &Credential,
        payload: &I::Payload,
        limit: Duration,
    ) -> Result<I::Output, InvokeError> {
        self.attempt(credential, payload, limit).await
    }

    async fn attempt(
        &self,
        credential: &Credential,
        payload: &I::Payload,
        limit: Duration,
    ) -> Result<I::Output, InvokeError> {
        let result = match timeout(limit, self.invoker.invoke(credential, payload)).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Timeout(limit)),
        };
        match &result {
            Ok(_) => self.pool.report_success(credential),
            Err(e) => self.pool.report_failure(credential, e),
        }
        result
    }
}
