//! Circuit breaker for outbound operations
//!
//! Wraps bus publishes and station sends. State lives behind a mutex so every
//! dispatch path targeting the same resource sees the same counters.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls flow through
    Closed,
    /// Tripped, calls are rejected without running
    Open,
    /// Probing whether the resource recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Cooldown before trial calls are let through
    pub reset_timeout_seconds: u64,
    /// Concurrent trial calls allowed while half-open
    pub half_open_max_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_seconds: 30,
            half_open_max_trials: 1,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_seconds)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// Rejected without attempting the operation
    Open(String),

    /// The operation ran and failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open(name) => write!(f, "Circuit breaker {} is open", name),
            BreakerError::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Open(_) => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}

/// How a call got past the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Normal,
    /// One of the trial calls allowed while half-open
    Trial,
}

/// Counters and transitions; every transition is a function of these fields and `now`
#[derive(Debug, Clone)]
pub(crate) struct Counters {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

impl Counters {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            trials_in_flight: 0,
        }
    }

    fn cooled_down(&self, config: &BreakerConfig, now: Instant) -> bool {
        self.opened_at
            .is_some_and(|opened| now.saturating_duration_since(opened) >= config.reset_timeout())
    }

    /// State as seen at `now`, without mutating
    fn observed(&self, config: &BreakerConfig, now: Instant) -> BreakerState {
        match self.state {
            BreakerState::Open if self.cooled_down(config, now) => BreakerState::HalfOpen,
            state => state,
        }
    }

    /// Ask to run one call
    fn try_acquire(&mut self, config: &BreakerConfig, now: Instant) -> Option<Admission> {
        if self.state == BreakerState::Open && self.cooled_down(config, now) {
            self.state = BreakerState::HalfOpen;
            self.trials_in_flight = 0;
        }
        match self.state {
            BreakerState::Closed => Some(Admission::Normal),
            BreakerState::Open => None,
            BreakerState::HalfOpen => {
                if self.trials_in_flight < config.half_open_max_trials.max(1) {
                    self.trials_in_flight += 1;
                    Some(Admission::Trial)
                } else {
                    None
                }
            }
        }
    }

    fn on_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
            self.opened_at = None;
            self.trials_in_flight = 0;
        }
    }

    fn on_failure(&mut self, config: &BreakerConfig, now: Instant) {
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
        match self.state {
            BreakerState::Closed if self.consecutive_failures >= config.failure_threshold => self.trip(now),
            BreakerState::HalfOpen => self.trip(now),
            _ => {}
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trials_in_flight = 0;
    }
}

/// Named circuit breaker guarding one outbound resource
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            counters: Mutex::new(Counters::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.counters.lock().observed(&self.config, Instant::now())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.counters.lock().consecutive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.counters.lock().last_failure
    }

    /// Run `op` unless the breaker is open
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(admission) = self.counters.lock().try_acquire(&self.config, Instant::now()) else {
            return Err(BreakerError::Open(self.name.clone()));
        };
        let mut permit = Permit {
            breaker: self,
            admission,
            settled: false,
        };

        let outcome = op().await;
        permit.settled = true;
        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn record_success(&self) {
        let mut counters = self.counters.lock();
        if counters.state == BreakerState::HalfOpen {
            info!("Circuit breaker {} closed after successful trial", self.name);
        }
        counters.on_success();
    }

    fn record_failure(&self) {
        let mut counters = self.counters.lock();
        let was = counters.state;
        counters.on_failure(&self.config, Instant::now());
        if was != BreakerState::Open && counters.state == BreakerState::Open {
            warn!(
                "Circuit breaker {} opened after {} consecutive failures",
                self.name, counters.consecutive_failures
            );
        }
    }
}

/// Admission held while a call runs. A trial dropped before it settles
/// counts as a failed trial, so its slot is not lost.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.settled || self.admission != Admission::Trial {
            return;
        }
        warn!("Circuit breaker {} trial was cancelled", self.breaker.name);
        self.breaker.record_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn config(threshold: u32, reset_secs: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_seconds: reset_secs,
            half_open_max_trials: 1,
        }
    }

    #[test]
    fn test_transitions_are_pure() {
        let cfg = config(2, 10);
        let t0 = Instant::now();
        let mut c = Counters::new();

        assert_eq!(c.try_acquire(&cfg, t0), Some(Admission::Normal));
        c.on_failure(&cfg, t0);
        assert_eq!(c.state, BreakerState::Closed);
        c.on_failure(&cfg, t0);
        assert_eq!(c.state, BreakerState::Open);

        assert_eq!(c.try_acquire(&cfg, t0 + Duration::from_secs(9)), None);
        assert_eq!(c.observed(&cfg, t0 + Duration::from_secs(10)), BreakerState::HalfOpen);

        // One trial allowed, the second is rejected while the first is in flight
        assert_eq!(c.try_acquire(&cfg, t0 + Duration::from_secs(10)), Some(Admission::Trial));
        assert_eq!(c.try_acquire(&cfg, t0 + Duration::from_secs(10)), None);

        c.on_failure(&cfg, t0 + Duration::from_secs(11));
        assert_eq!(c.state, BreakerState::Open);

        assert_eq!(c.try_acquire(&cfg, t0 + Duration::from_secs(21)), Some(Admission::Trial));
        c.on_success();
        assert_eq!(c.state, BreakerState::Closed);
        assert_eq!(c.consecutive_failures, 0);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cfg = config(3, 10);
        let now = Instant::now();
        let mut c = Counters::new();
        c.on_failure(&cfg, now);
        c.on_failure(&cfg, now);
        c.on_success();
        c.on_failure(&cfg, now);
        assert_eq!(c.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_without_running() {
        let breaker = CircuitBreaker::new("station-send", config(1, 60));

        let result: Result<(), _> = breaker.call(|| async { Err::<(), _>("down") }).await;
        assert_eq!(result, Err(BreakerError::Inner("down")));
        assert_eq!(breaker.state(), BreakerState::Open);

        let mut ran = false;
        let result: Result<(), BreakerError<&str>> = breaker
            .call(|| {
                ran = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open(name)) if name == "station-send"));
        assert!(!ran);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_through_half_open() {
        let breaker = CircuitBreaker::new("bus", config(1, 5));
        let _ = breaker.call(|| async { Err::<(), _>(()) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let result = breaker.call(|| async { Ok::<_, ()>(7) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_releases_its_slot() {
        let breaker = CircuitBreaker::new("x", config(1, 1));
        let _ = breaker.call(|| async { Err::<(), _>(()) }).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        // The trial never finishes; the caller gives up on it
        let trial = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call(|| std::future::pending::<Result<(), ()>>()),
        )
        .await;
        assert!(trial.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(2)).await;
        let result = breaker.call(|| async { Ok::<_, ()>(1) }).await;
        assert_eq!(result, Ok(1));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_all_counted() {
        let breaker = Arc::new(CircuitBreaker::new("bus", config(1000, 60)));
        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let breaker = breaker.clone();
                tokio::spawn(async move {
                    let _ = breaker
                        .call(|| async {
                            tokio::task::yield_now().await;
                            Err::<(), _>(())
                        })
                        .await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(breaker.consecutive_failures(), 200);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_half_open_admits_one_trial_under_contention() {
        let breaker = Arc::new(CircuitBreaker::new("station", config(1, 0)));
        let _ = breaker.call(|| async { Err::<(), _>(()) }).await;

        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, ()>(())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let others: Vec<_> = (0..50)
            .map(|_| {
                let breaker = breaker.clone();
                let ran = ran.clone();
                tokio::spawn(async move {
                    breaker
                        .call(|| async move {
                            ran.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, ()>(())
                        })
                        .await
                })
            })
            .collect();
        for other in others {
            assert!(matches!(other.await.unwrap(), Err(BreakerError::Open(_))));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap(), Ok(()));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
