//! Circuit breaker guarding one dependency edge.
//!
//! ## States
//! - **Closed**: calls pass through; counts roll over every `interval`.
//! - **Open**: calls fail fast without running the operation until `timeout` elapses.
//! - **HalfOpen**: up to `max_requests` concurrent trials; the first success
//!   closes the breaker, any failure reopens it.
//!
//! Every state change starts a new generation. Outcomes reported by calls
//! that began in an earlier generation are discarded.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::AppError;
use crate::infra::metrics;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half-open",
            Self::Open => "open",
        }
    }

    /// Gauge encoding used by `ledger_breaker_state`
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request counters for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    /// Failures over requests in this generation, 0.0 when idle
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

/// Trip when more than 5 calls failed in a row, or when at least half of
/// 10 or more calls in the window failed.
pub fn default_ready_to_trip(counts: &Counts) -> bool {
    counts.consecutive_failures > 5 || (counts.requests >= 10 && counts.failure_ratio() >= 0.5)
}

pub type TripPolicy = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Called with (breaker name, from, to). Runs on the caller's task after the
/// breaker's lock is released; must return quickly.
pub type StateChangeHook = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

/// Breaker policy
#[derive(Clone)]
pub struct BreakerSettings {
    /// Concurrent trials allowed while half-open
    pub max_requests: u32,
    /// Cyclic reset period for counts while closed; zero never resets
    pub interval: Duration,
    /// Time spent open before admitting trials
    pub timeout: Duration,
    pub ready_to_trip: TripPolicy,
    pub on_state_change: Option<StateChangeHook>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            ready_to_trip: Arc::new(default_ready_to_trip),
            on_state_change: None,
        }
    }
}

impl fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish_non_exhaustive()
    }
}

impl BreakerSettings {
    #[must_use]
    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests.max(1);
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ready_to_trip<F>(mut self, policy: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Arc::new(policy);
        self
    }

    #[must_use]
    pub fn with_on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, BreakerState, BreakerState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }
}

/// Outcome of a call made through a breaker
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Breaker is open; the operation was not invoked
    #[error("circuit breaker '{breaker}' is open")]
    Open { breaker: String },

    /// Half-open trial slots are exhausted; the operation was not invoked
    #[error("circuit breaker '{breaker}' is half-open and at its trial limit")]
    TooManyRequests { breaker: String },

    /// The operation ran and failed
    #[error("call through '{breaker}' failed: {error}")]
    Failure { breaker: String, error: E },
}

impl<E> BreakerError<E> {
    /// True when the breaker refused the call
    pub fn is_rejected(&self) -> bool {
        !matches!(self, Self::Failure { .. })
    }
}

impl From<BreakerError<AppError>> for AppError {
    fn from(err: BreakerError<AppError>) -> Self {
        match err {
            BreakerError::Open { breaker } => AppError::DependencyUnavailable {
                breaker,
                reason: "circuit breaker is open".to_string(),
            },
            BreakerError::TooManyRequests { breaker } => AppError::DependencyUnavailable {
                breaker,
                reason: "circuit breaker is half-open and at its trial limit".to_string(),
            },
            BreakerError::Failure { breaker, error } => AppError::DependencyFailure {
                breaker,
                source: Box::new(error),
            },
        }
    }
}

type Transition = (BreakerState, BreakerState);

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    /// Closed: end of the counting window. Open: end of the timeout.
    expiry: Option<Instant>,
    half_open_in_flight: u32,
}

/// Thread-safe circuit breaker; share it behind an `Arc`.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.lock().state)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let name = name.into();
        let expiry = if settings.interval.is_zero() {
            None
        } else {
            Some(Instant::now() + settings.interval)
        };
        metrics::try_set_breaker_state(&name, BreakerState::Closed.as_gauge());
        Self {
            name,
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Current state, applying any clock-driven transition first
    pub fn state(&self) -> BreakerState {
        let (state, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    /// Counts of the current generation
    pub fn counts(&self) -> Counts {
        let (counts, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (inner.counts, transition)
        };
        self.notify(transition);
        counts
    }

    /// Run `operation` if the breaker admits it and record the outcome.
    ///
    /// Any `Err` from the operation counts as a failure. Callers that need
    /// to exclude client-caused errors should return them inside `Ok`.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ticket = match self.before_request() {
            Ok(ticket) => ticket,
            Err(rejected) => {
                metrics::try_record_breaker_request(&self.name, "rejected");
                return Err(rejected);
            }
        };

        let result = operation().await;
        ticket.finish(result.is_ok());

        match result {
            Ok(value) => {
                metrics::try_record_breaker_request(&self.name, "success");
                Ok(value)
            }
            Err(error) => {
                metrics::try_record_breaker_request(&self.name, "failure");
                Err(BreakerError::Failure {
                    breaker: self.name.clone(),
                    error,
                })
            }
        }
    }

    fn before_request<E>(&self) -> Result<Ticket<'_>, BreakerError<E>> {
        let (admitted, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner, Instant::now());

            let admitted = match inner.state {
                BreakerState::Open => Err(BreakerError::Open {
                    breaker: self.name.clone(),
                }),
                BreakerState::HalfOpen
                    if inner.half_open_in_flight >= self.settings.max_requests =>
                {
                    Err(BreakerError::TooManyRequests {
                        breaker: self.name.clone(),
                    })
                }
                state => {
                    inner.counts.on_request();
                    let trial = state == BreakerState::HalfOpen;
                    if trial {
                        inner.half_open_in_flight += 1;
                    }
                    Ok(Ticket {
                        breaker: self,
                        generation: inner.generation,
                        trial,
                        finished: false,
                    })
                }
            };
            (admitted, transition)
        };
        self.notify(transition);
        admitted
    }

    /// Record an outcome for a call started in `generation`. `None` only
    /// releases the trial slot.
    fn after_request(&self, generation: u64, trial: bool, outcome: Option<bool>) {
        let transition = {
            let mut inner = self.lock();
            let now = Instant::now();
            if trial && inner.generation == generation {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }

            let mut transition = self.refresh(&mut inner, now);
            if inner.generation == generation {
                match outcome {
                    Some(true) => transition = transition.or(self.on_success(&mut inner, now)),
                    Some(false) => transition = transition.or(self.on_failure(&mut inner, now)),
                    None => {}
                }
            } else if outcome.is_some() {
                debug!(breaker = %self.name, "Discarding outcome from a previous generation");
            }
            transition
        };
        self.notify(transition);
    }

    fn on_success(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        inner.counts.on_success();
        match inner.state {
            BreakerState::HalfOpen => self.set_state(inner, BreakerState::Closed, now),
            _ => None,
        }
    }

    fn on_failure(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        inner.counts.on_failure();
        match inner.state {
            BreakerState::Closed if (self.settings.ready_to_trip)(&inner.counts) => {
                self.set_state(inner, BreakerState::Open, now)
            }
            BreakerState::HalfOpen => self.set_state(inner, BreakerState::Open, now),
            _ => None,
        }
    }

    /// Apply clock-driven changes: window rollover and open timeout
    fn refresh(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        let expired = inner.expiry.is_some_and(|expiry| expiry <= now);
        match inner.state {
            BreakerState::Closed if expired => {
                self.new_generation(inner, now);
                None
            }
            BreakerState::Open if expired => self.set_state(inner, BreakerState::HalfOpen, now),
            _ => None,
        }
    }

    fn set_state(&self, inner: &mut Inner, to: BreakerState, now: Instant) -> Option<Transition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        self.new_generation(inner, now);
        Some((from, to))
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.half_open_in_flight = 0;
        inner.expiry = match inner.state {
            BreakerState::Closed if self.settings.interval.is_zero() => None,
            BreakerState::Closed => Some(now + self.settings.interval),
            BreakerState::Open => Some(now + self.settings.timeout),
            BreakerState::HalfOpen => None,
        };
    }

    fn notify(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        warn!(
            breaker = %self.name,
            from = %from,
            to = %to,
            "Circuit breaker state changed"
        );
        metrics::try_set_breaker_state(&self.name, to.as_gauge());
        metrics::try_record_breaker_transition(&self.name, from.as_str(), to.as_str());
        if let Some(hook) = &self.settings.on_state_change {
            hook(&self.name, from, to);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission for one call. Dropping it unfinished releases a half-open
/// slot without recording an outcome.
struct Ticket<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    finished: bool,
}

impl Ticket<'_> {
    fn finish(mut self, success: bool) {
        self.finished = true;
        self.breaker
            .after_request(self.generation, self.trial, Some(success));
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.after_request(self.generation, self.trial, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.execute(|| async { Ok::<(), &str>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_six_consecutive_failures_and_fails_fast() {
        let breaker = CircuitBreaker::new("test", BreakerSettings::default());

        for _ in 0..5 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Failure { .. })));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(result.unwrap_err().is_rejected());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_keep_exact_counts() {
        let breaker = Arc::new(CircuitBreaker::new(
            "concurrent",
            BreakerSettings::default().with_ready_to_trip(|_| false),
        ));

        let handles: Vec<_> = (0..16)
            .map(|task| {
                let breaker = Arc::clone(&breaker);
                tokio::spawn(async move {
                    for call in 0..50 {
                        let outcome = if (task + call) % 2 == 0 {
                            fail(&breaker).await
                        } else {
                            succeed(&breaker).await
                        };
                        assert!(!matches!(outcome, Err(BreakerError::Open { .. })));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let counts = breaker.counts();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(counts.requests, 800);
        assert_eq!(counts.total_failures, 400);
        assert_eq!(counts.total_successes, 400);
    }

    #[tokio::test]
    async fn test_failure_ratio_needs_minimum_volume() {
        let breaker = CircuitBreaker::new("ratio", BreakerSettings::default());

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Closed);

        succeed(&breaker).await.unwrap();
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
            succeed(&breaker).await.unwrap();
        }
        // 9 requests, 4 failures
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail(&breaker).await.unwrap_err();
        // 10 requests, 5 failures
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes_and_resets_counts() {
        let breaker = CircuitBreaker::new("recover", BreakerSettings::default());
        for _ in 0..6 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.counts().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("relapse", BreakerSettings::default());
        for _ in 0..6 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(matches!(fail(&breaker).await, Err(BreakerError::Failure { .. })));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_trials() {
        let breaker = Arc::new(CircuitBreaker::new("bounded", BreakerSettings::default()));
        for _ in 0..6 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let gate = Arc::new(Semaphore::new(0));
        let mut trials = Vec::new();
        for _ in 0..3 {
            let breaker = Arc::clone(&breaker);
            let gate = Arc::clone(&gate);
            trials.push(tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _permit = gate.acquire().await.map_err(|_| "closed")?;
                        Ok::<(), &str>(())
                    })
                    .await
            }));
        }
        while breaker.counts().requests < 3 {
            tokio::task::yield_now().await;
        }

        let invoked = AtomicUsize::new(0);
        let extra = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;
        assert!(matches!(extra, Err(BreakerError::TooManyRequests { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        gate.add_permits(3);
        for trial in trials {
            trial.await.unwrap().unwrap();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_its_slot() {
        let settings = BreakerSettings::default().with_max_requests(1);
        let breaker = Arc::new(CircuitBreaker::new("dropped", settings));
        for _ in 0..6 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let stuck = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .execute(|| std::future::pending::<Result<(), &str>>())
                    .await
            })
        };
        while breaker.counts().requests < 1 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::TooManyRequests { .. })
        ));

        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_resets_closed_counts() {
        let breaker = CircuitBreaker::new("window", BreakerSettings::default());
        for _ in 0..5 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.counts().consecutive_failures, 5);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.counts(), Counts::default());

        // A fresh window needs six failures again
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_outcome_from_previous_generation_is_ignored() {
        let breaker = Arc::new(CircuitBreaker::new("stale", BreakerSettings::default()));
        let gate = Arc::new(Semaphore::new(0));

        let slow = {
            let breaker = Arc::clone(&breaker);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _permit = gate.acquire().await.map_err(|_| "closed")?;
                        Err::<(), &str>("late failure")
                    })
                    .await
            })
        };
        while breaker.counts().requests < 1 {
            tokio::task::yield_now().await;
        }

        for _ in 0..6 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        gate.add_permits(1);
        slow.await.unwrap().unwrap_err();
        assert_eq!(breaker.counts(), Counts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_hook_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let settings = BreakerSettings::default().with_on_state_change({
            let seen = Arc::clone(&seen);
            move |name, from, to| seen.lock().unwrap().push((name.to_string(), from, to))
        });
        let breaker = CircuitBreaker::new("hooked", settings);

        for _ in 0..6 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        succeed(&breaker).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("hooked".to_string(), BreakerState::Closed, BreakerState::Open),
                ("hooked".to_string(), BreakerState::Open, BreakerState::HalfOpen),
                ("hooked".to_string(), BreakerState::HalfOpen, BreakerState::Closed),
            ]
        );
    }

    #[test]
    fn test_breaker_error_maps_onto_app_error() {
        let open: AppError = BreakerError::<AppError>::Open {
            breaker: "transaction->user".to_string(),
        }
        .into();
        assert!(open.is_temporarily_unavailable());

        let failed: AppError = BreakerError::Failure {
            breaker: "transaction->user".to_string(),
            error: AppError::Internal("down".to_string()),
        }
        .into();
        assert!(matches!(failed, AppError::DependencyFailure { .. }));
    }
}
