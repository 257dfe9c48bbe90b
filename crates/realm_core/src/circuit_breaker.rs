//! Three-state circuit breaker for calls to external dependencies.
//!
//! State moves Closed → Open after `max_failures` consecutive failures,
//! Open → HalfOpen lazily when a caller arrives after `open_timeout`, and
//! HalfOpen → Closed after `max_half_open_trials` successful trials. Any
//! failure while half-open re-opens the breaker.
//!
//! Every transition bumps a generation counter. A call records its outcome
//! only if the generation it was admitted under is still current, so a slow
//! call from an earlier epoch can never flip a breaker that has since moved on.

use crate::config::BreakerConfig;
use crate::error::BreakerError;
use crate::utils::panic_message;
use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub half_open_in_flight: u32,
    pub half_open_successes: u32,
    /// Milliseconds since the last recorded failure, if any.
    pub since_last_failure_ms: Option<u64>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    in_flight: u32,
    trial_successes: u32,
    last_failure: Option<Instant>,
    generation: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            in_flight: 0,
            trial_successes: 0,
            last_failure: None,
            generation: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejected: 0,
        }
    }

    fn transition(&mut self, to: BreakerState) {
        self.state = to;
        self.in_flight = 0;
        self.trial_successes = 0;
        self.generation = self.generation.wrapping_add(1);
        if to == BreakerState::Closed {
            self.failures = 0;
        }
    }
}

/// Admission ticket for one protected call.
///
/// Settled exactly once with the call's outcome. A ticket dropped unsettled
/// (the caller abandoned the call) gives its half-open trial slot back
/// without recording anything.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation, self.trial);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

/// Aborts the spawned call if the caller stops waiting for it.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Circuit breaker guarding one named dependency.
///
/// Protected futures run on their own tokio task, so a panic inside one is
/// reported as [`BreakerError::Panicked`] instead of unwinding through the
/// caller.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Critical sections never panic midway, so a poisoned guard still holds
        // consistent counters.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored state. An open breaker whose timeout has elapsed still reports
    /// `Open` until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.failures,
            half_open_in_flight: inner.in_flight,
            half_open_successes: inner.trial_successes,
            since_last_failure_ms: inner.last_failure.map(|at| at.elapsed().as_millis() as u64),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejected: inner.total_rejected,
        }
    }

    /// Forces the breaker closed and forgets the failure history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.transition(BreakerState::Closed);
        inner.last_failure = None;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn admit(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();

        if inner.state == BreakerState::Open {
            let cooled = inner
                .last_failure
                .map_or(true, |at| at.elapsed() >= self.config.open_timeout);
            if !cooled {
                inner.total_rejected += 1;
                return None;
            }
            inner.transition(BreakerState::HalfOpen);
            debug!(breaker = %self.name, "Circuit breaker half-open, admitting trial calls");
        }

        let trial = inner.state == BreakerState::HalfOpen;
        if trial {
            if inner.in_flight >= self.config.max_half_open_trials.max(1) {
                inner.total_rejected += 1;
                return None;
            }
            inner.in_flight += 1;
        }

        Some(Permit {
            breaker: self,
            generation: inner.generation,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, generation: u64, trial: bool) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        if inner.generation != generation {
            return;
        }

        match inner.state {
            BreakerState::Closed => inner.failures = 0,
            BreakerState::HalfOpen if trial => {
                inner.in_flight = inner.in_flight.saturating_sub(1);
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.max_half_open_trials.max(1) {
                    inner.transition(BreakerState::Closed);
                    info!(breaker = %self.name, "✅ Circuit breaker closed");
                }
            }
            _ => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        if inner.generation != generation {
            return;
        }

        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                inner.last_failure = Some(Instant::now());
                if inner.failures >= self.config.max_failures.max(1) {
                    let failures = inner.failures;
                    inner.transition(BreakerState::Open);
                    warn!(breaker = %self.name, failures, "Circuit breaker opened");
                }
            }
            BreakerState::HalfOpen => {
                inner.last_failure = Some(Instant::now());
                inner.transition(BreakerState::Open);
                warn!(breaker = %self.name, "Trial call failed, circuit breaker re-opened");
            }
            BreakerState::Open => {}
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == BreakerState::HalfOpen {
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
    }

    /// Runs `call` through the breaker.
    pub async fn execute<F, T, E>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.run(call, None, std::future::pending()).await
    }

    /// Runs `call` through the breaker, giving up after `deadline`.
    /// A call that times out is aborted and counted as a failure.
    pub async fn execute_with_timeout<F, T, E>(
        &self,
        deadline: Duration,
        call: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.run(call, Some(deadline), std::future::pending()).await
    }

    /// Runs `call` through the breaker until `cancel` resolves.
    /// A cancelled call is aborted and counted as a failure.
    pub async fn execute_cancellable<C, F, T, E>(
        &self,
        cancel: C,
        call: F,
    ) -> Result<T, BreakerError<E>>
    where
        C: Future<Output = ()>,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.run(call, None, cancel).await
    }

    async fn run<C, F, T, E>(
        &self,
        call: F,
        deadline: Option<Duration>,
        cancel: C,
    ) -> Result<T, BreakerError<E>>
    where
        C: Future<Output = ()>,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let Some(permit) = self.admit() else {
            debug!(breaker = %self.name, "Call rejected by open circuit breaker");
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        };

        let mut task = tokio::spawn(call);
        let _abort = AbortOnDrop(task.abort_handle());
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(BreakerError::Failed(error)),
                Err(join_error) if join_error.is_panic() => {
                    let message = panic_message(join_error);
                    warn!(breaker = %self.name, panic = %message, "Protected call panicked");
                    Err(BreakerError::Panicked(message))
                }
                Err(_) => Err(BreakerError::Cancelled),
            },
            _ = expired => Err(BreakerError::TimedOut(deadline.unwrap_or_default())),
            _ = cancel => Err(BreakerError::Cancelled),
        };

        match outcome {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        outcome
    }
}
