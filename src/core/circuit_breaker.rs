//! Circuit Breaker Implementation
//!
//! Per-route circuit breakers that protect backends from cascading failure.
//! The state machine has three states: Closed, Open and HalfOpen.
//!
//! ## States:
//! - **Closed**: every call is admitted and its outcome goes into a sliding
//!   window of the last `sliding_window_size` calls. The circuit opens when the
//!   failure rate or the slow-call rate reaches its threshold.
//! - **Open**: calls are rejected without touching the backend until
//!   `wait_duration_in_open` has elapsed.
//! - **HalfOpen**: up to `permitted_calls_in_half_open` trial calls are admitted.
//!   Once all of them have completed the circuit closes, or reopens if the
//!   trials still breach a threshold.
//!
//! Rates are computed against the window capacity. Until the window fills this
//! is a lower bound on the eventual rate, so a burst of failures can open the
//! circuit before the window is full (5 failures out of a window of 10 already
//! guarantee a 50% failure rate).
//!
//! A HalfOpen trial slot is only given back by recording the call or by
//! dropping its [`Admission`]. A trial whose request was cancelled or panicked
//! therefore frees its slot instead of holding the breaker in HalfOpen.
//!
//! ## Key Rust Concepts:
//! - One `parking_lot::Mutex` per breaker serializes admit/record, so outcomes
//!   are never lost or double counted
//! - `Drop` on [`Admission`] releases unrecorded trial slots
//! - `DashMap` keeps the registry lock-free across different routes
//! - `AtomicU64` counters for metrics that are read without the state lock

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::types::CallOutcome;
use crate::observability::metrics::BREAKER_TRANSITIONS_TOTAL;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of most recent calls kept in the window
    pub sliding_window_size: usize,

    /// Failure percentage (0-100] that opens the circuit
    pub failure_rate_threshold: f64,

    /// Slow-call percentage (0-100] that opens the circuit
    pub slow_call_rate_threshold: f64,

    /// Calls taking at least this long count as slow
    #[serde(with = "humantime_serde")]
    pub slow_call_duration_threshold: Duration,

    /// How long to stay Open before trying HalfOpen
    #[serde(with = "humantime_serde")]
    pub wait_duration_in_open: Duration,

    /// Trial calls admitted in HalfOpen
    pub permitted_calls_in_half_open: u32,

    /// Upper bound on one (retried) backend call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sliding_window_size: 10,
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_secs(2),
            wait_duration_in_open: Duration::from_secs(10),
            permitted_calls_in_half_open: 5,
            timeout: Duration::from_secs(5),
        }
    }
}

impl CircuitBreakerConfig {
    /// Stricter profile for authentication backends: fail fast, recover slowly
    pub fn auth_profile() -> Self {
        Self {
            sliding_window_size: 5,
            failure_rate_threshold: 40.0,
            slow_call_rate_threshold: 40.0,
            slow_call_duration_threshold: Duration::from_secs(3),
            wait_duration_in_open: Duration::from_secs(15),
            permitted_calls_in_half_open: 3,
            timeout: Duration::from_secs(10),
        }
    }

    /// Problems with this profile, prefixed with `name`
    pub fn validate(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.sliding_window_size == 0 {
            errors.push(format!("circuit breaker '{}': sliding_window_size must be greater than 0", name));
        }
        if self.permitted_calls_in_half_open == 0 {
            errors.push(format!(
                "circuit breaker '{}': permitted_calls_in_half_open must be greater than 0",
                name
            ));
        }
        for (field, value) in [
            ("failure_rate_threshold", self.failure_rate_threshold),
            ("slow_call_rate_threshold", self.slow_call_rate_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                errors.push(format!(
                    "circuit breaker '{}': {} must be in (0, 100], got {}",
                    name, field, value
                ));
            }
        }
        if self.timeout.is_zero() {
            errors.push(format!("circuit breaker '{}': timeout must be greater than 0", name));
        }
        errors
    }

    fn breaches(&self, failed: usize, slow: usize, denominator: usize) -> bool {
        if denominator == 0 {
            return false;
        }
        let failure_rate = failed as f64 * 100.0 / denominator as f64;
        let slow_rate = slow as f64 * 100.0 / denominator as f64;
        failure_rate >= self.failure_rate_threshold || slow_rate >= self.slow_call_rate_threshold
    }
}

/// Public view of a breaker's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    failed: bool,
    slow: bool,
}

/// Bounded history of recent call outcomes with running totals
#[derive(Debug)]
struct SlidingWindow {
    capacity: usize,
    records: VecDeque<CallRecord>,
    failed: usize,
    slow: usize,
}

impl SlidingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
            failed: 0,
            slow: 0,
        }
    }

    fn push(&mut self, record: CallRecord) {
        if self.records.len() == self.capacity {
            if let Some(evicted) = self.records.pop_front() {
                self.failed -= evicted.failed as usize;
                self.slow -= evicted.slow as usize;
            }
        }
        self.failed += record.failed as usize;
        self.slow += record.slow as usize;
        self.records.push_back(record);
    }

    fn clear(&mut self) {
        self.records.clear();
        self.failed = 0;
        self.slow = 0;
    }
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { issued: u32, completed: u32, failed: u32, slow: u32 },
}

#[derive(Debug)]
struct BreakerInner {
    phase: Phase,
    window: SlidingWindow,
    /// Bumped on every entry into HalfOpen, so a slot is only ever released
    /// into the trial round that issued it
    generation: u64,
}

/// Metrics collected by the circuit breaker
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    pub admitted_calls: AtomicU64,
    pub rejected_calls: AtomicU64,
    pub successful_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub slow_calls: AtomicU64,
    pub times_opened: AtomicU64,
}

/// Immutable snapshot of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub buffered_calls: usize,
    pub failure_rate: f64,
    pub slow_call_rate: f64,
    pub admitted_calls: u64,
    pub rejected_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub slow_calls: u64,
    pub times_opened: u64,
}

/// Circuit breaker guarding one route's backend
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let window = SlidingWindow::new(config.sliding_window_size.max(1));
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                phase: Phase::Closed,
                window,
                generation: 0,
            }),
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.metrics
    }

    /// Current state; an Open breaker whose wait has elapsed reports HalfOpen
    /// only after the next `admit`.
    pub fn state(&self) -> BreakerState {
        match self.inner.lock().phase {
            Phase::Closed => BreakerState::Closed,
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Decide whether a call may proceed. The caller must `record` every
    /// admitted call; prefer [`CircuitBreaker::try_acquire`] when the call can
    /// be abandoned before it completes.
    pub fn admit(&self) -> bool {
        self.admit_in_generation().is_some()
    }

    /// Admit a call and return a permit that is settled by recording its outcome.
    /// Dropping the permit unrecorded gives a HalfOpen trial slot back.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Admission> {
        self.admit_in_generation().map(|generation| Admission {
            breaker: Arc::clone(self),
            generation,
            settled: false,
        })
    }

    fn admit_in_generation(&self) -> Option<u64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let admitted = match inner.phase {
            Phase::Closed => true,
            Phase::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.wait_duration_in_open {
                    inner.phase = Phase::HalfOpen {
                        issued: 1,
                        completed: 0,
                        failed: 0,
                        slow: 0,
                    };
                    inner.generation += 1;
                    self.on_transition(BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            Phase::HalfOpen { ref mut issued, .. } => {
                if *issued < self.config.permitted_calls_in_half_open {
                    *issued += 1;
                    true
                } else {
                    false
                }
            }
        };

        if admitted {
            self.metrics.admitted_calls.fetch_add(1, Ordering::Relaxed);
            Some(inner.generation)
        } else {
            self.metrics.rejected_calls.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Hand back a trial slot of an admitted call that will never be recorded
    fn release(&self, generation: u64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.generation != generation {
            return;
        }
        if let Phase::HalfOpen {
            ref mut issued,
            completed,
            ..
        } = inner.phase
        {
            if *issued > completed {
                *issued -= 1;
                debug!(breaker = %self.name, "Unfinished trial call released its slot");
            }
        }
    }

    /// Record the outcome of an admitted call
    pub fn record(&self, outcome: CallOutcome, duration: Duration) {
        let failed = outcome.is_failure();
        let slow = duration >= self.config.slow_call_duration_threshold;

        if failed {
            self.metrics.failed_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.successful_calls.fetch_add(1, Ordering::Relaxed);
        }
        if slow {
            self.metrics.slow_calls.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        match inner.phase {
            Phase::Closed => {
                inner.window.push(CallRecord { failed, slow });
                if self.config.breaches(
                    inner.window.failed,
                    inner.window.slow,
                    inner.window.capacity,
                ) {
                    warn!(
                        breaker = %self.name,
                        failed = inner.window.failed,
                        slow = inner.window.slow,
                        window = inner.window.capacity,
                        "Circuit breaker opening"
                    );
                    inner.phase = Phase::Open {
                        opened_at: Instant::now(),
                    };
                    self.on_transition(BreakerState::Open);
                }
            }
            // Late results from calls admitted before the circuit opened.
            Phase::Open { .. } => {}
            Phase::HalfOpen {
                issued,
                ref mut completed,
                failed: ref mut trial_failed,
                slow: ref mut trial_slow,
            } => {
                if *completed >= issued {
                    return;
                }
                *completed += 1;
                *trial_failed += failed as u32;
                *trial_slow += slow as u32;

                if *completed >= self.config.permitted_calls_in_half_open {
                    let trials = *completed as usize;
                    if self
                        .config
                        .breaches(*trial_failed as usize, *trial_slow as usize, trials)
                    {
                        warn!(breaker = %self.name, "Trial calls failed, circuit breaker reopening");
                        inner.phase = Phase::Open {
                            opened_at: Instant::now(),
                        };
                        self.on_transition(BreakerState::Open);
                    } else {
                        info!(breaker = %self.name, "Trial calls succeeded, circuit breaker closing");
                        inner.phase = Phase::Closed;
                        inner.window.clear();
                        self.on_transition(BreakerState::Closed);
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let (state, buffered_calls, failure_rate, slow_call_rate) = {
            let inner = self.inner.lock();
            let window = &inner.window;
            let rate = |count: usize| {
                if window.records.is_empty() {
                    0.0
                } else {
                    count as f64 * 100.0 / window.records.len() as f64
                }
            };
            let state = match inner.phase {
                Phase::Closed => BreakerState::Closed,
                Phase::Open { .. } => BreakerState::Open,
                Phase::HalfOpen { .. } => BreakerState::HalfOpen,
            };
            (state, window.records.len(), rate(window.failed), rate(window.slow))
        };

        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state,
            buffered_calls,
            failure_rate,
            slow_call_rate,
            admitted_calls: self.metrics.admitted_calls.load(Ordering::Relaxed),
            rejected_calls: self.metrics.rejected_calls.load(Ordering::Relaxed),
            successful_calls: self.metrics.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.metrics.failed_calls.load(Ordering::Relaxed),
            slow_calls: self.metrics.slow_calls.load(Ordering::Relaxed),
            times_opened: self.metrics.times_opened.load(Ordering::Relaxed),
        }
    }

    fn on_transition(&self, to: BreakerState) {
        if to == BreakerState::Open {
            self.metrics.times_opened.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!(
            BREAKER_TRANSITIONS_TOTAL,
            "breaker" => self.name.clone(),
            "to" => to.to_string()
        )
        .increment(1);
    }
}

/// Permission for one admitted call, see [`CircuitBreaker::try_acquire`]
#[derive(Debug)]
#[must_use = "dropping an admission without recording it abandons the call"]
pub struct Admission {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    settled: bool,
}

impl Admission {
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Record the call's outcome, settling the admission
    pub fn record(mut self, outcome: CallOutcome, duration: Duration) {
        self.settled = true;
        self.breaker.record(outcome, duration);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation);
        }
    }
}

/// Registry owning one breaker per route key, created lazily on first use.
/// Keys name breaker instances; profiles only supply their configuration.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    profiles: std::collections::HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        default_config: CircuitBreakerConfig,
        profiles: std::collections::HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            profiles,
        }
    }

    /// Configuration of the named profile, or the default one
    pub fn config_for(&self, profile: Option<&str>) -> &CircuitBreakerConfig {
        profile
            .and_then(|name| self.profiles.get(name))
            .unwrap_or(&self.default_config)
    }

    /// Get or create the breaker for `route_id` with the default profile
    pub fn get(&self, route_id: &str) -> Arc<CircuitBreaker> {
        self.get_with_profile(route_id, None)
    }

    /// Get or create the breaker for `route_id`; `profile` only applies on creation
    pub fn get_with_profile(&self, route_id: &str, profile: Option<&str>) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(route_id) {
            return Arc::clone(breaker.value());
        }
        let config = self.config_for(profile).clone();
        Arc::clone(
            self.breakers
                .entry(route_id.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(route_id, config)))
                .value(),
        )
    }

    pub fn admit(&self, route_id: &str) -> bool {
        self.get(route_id).admit()
    }

    pub fn record(&self, route_id: &str, outcome: CallOutcome, duration: Duration) {
        self.get(route_id).record(outcome, duration)
    }

    /// Replace a breaker with a fresh one using `config`; its history is discarded
    pub fn reconfigure(&self, route_id: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(route_id, config));
        self.breakers
            .insert(route_id.to_string(), Arc::clone(&breaker));
        info!(breaker = %route_id, "Circuit breaker reconfigured");
        breaker
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: Duration = Duration::from_millis(5);

    fn config(window: usize, threshold: f64, half_open: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            sliding_window_size: window,
            failure_rate_threshold: threshold,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(2),
            wait_duration_in_open: Duration::from_secs(10),
            permitted_calls_in_half_open: half_open,
            timeout: Duration::from_secs(5),
        }
    }

    fn fail(cb: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            assert!(cb.admit());
            cb.record(CallOutcome::Failure, FAST);
        }
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.admit());
    }

    #[test]
    fn test_opens_when_failures_reach_threshold_of_window() {
        let cb = CircuitBreaker::new("items", config(10, 50.0, 3));

        fail(&cb, 4);
        assert_eq!(cb.state(), BreakerState::Closed);

        fail(&cb, 1);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.admit());
        assert_eq!(cb.metrics().rejected_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_full_window_of_failures_opens() {
        let cb = CircuitBreaker::new("svc", config(4, 100.0, 1));
        fail(&cb, 3);
        assert_eq!(cb.state(), BreakerState::Closed);
        fail(&cb, 1);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_successes_keep_circuit_closed() {
        let cb = CircuitBreaker::new("svc", config(4, 50.0, 1));
        for i in 0..20 {
            assert!(cb.admit());
            let outcome = if i % 4 == 0 { CallOutcome::Failure } else { CallOutcome::Success };
            cb.record(outcome, FAST);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().failure_rate, 25.0);
    }

    #[test]
    fn test_old_failures_slide_out_of_window() {
        let cb = CircuitBreaker::new("svc", config(4, 75.0, 1));
        fail(&cb, 2);
        for _ in 0..4 {
            assert!(cb.admit());
            cb.record(CallOutcome::Success, FAST);
        }
        fail(&cb, 2);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_slow_calls_open_circuit() {
        let mut cfg = config(4, 100.0, 1);
        cfg.slow_call_rate_threshold = 50.0;
        cfg.slow_call_duration_threshold = Duration::from_millis(100);
        let cb = CircuitBreaker::new("slow", cfg);

        for _ in 0..2 {
            assert!(cb.admit());
            cb.record(CallOutcome::Success, Duration::from_millis(150));
        }
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.metrics().slow_calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_timeouts_count_as_failures() {
        let cb = CircuitBreaker::new("svc", config(2, 100.0, 1));
        assert!(cb.admit());
        cb.record(CallOutcome::Timeout, FAST);
        assert!(cb.admit());
        cb.record(CallOutcome::Timeout, FAST);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_permitted_calls_then_closes() {
        let cb = CircuitBreaker::new("svc", config(2, 50.0, 3));
        fail(&cb, 1);
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!cb.admit());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.admit());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.admit());
        assert!(cb.admit());
        assert!(!cb.admit(), "only three trial calls are permitted");

        for _ in 0..3 {
            cb.record(CallOutcome::Success, FAST);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().buffered_calls, 0);
        assert!(cb.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_reopens_when_trials_fail() {
        let cb = CircuitBreaker::new("svc", config(2, 50.0, 2));
        fail(&cb, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.admit());
        assert!(cb.admit());
        cb.record(CallOutcome::Success, FAST);
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record(CallOutcome::Failure, FAST);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.admit());

        // openedAt was reset on reopening
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!cb.admit());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.admit());
        assert_eq!(cb.metrics().times_opened.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_late_results_while_open_are_ignored() {
        let cb = CircuitBreaker::new("svc", config(2, 50.0, 1));
        assert!(cb.admit());
        assert!(cb.admit());
        cb.record(CallOutcome::Failure, FAST);
        assert_eq!(cb.state(), BreakerState::Open);
        cb.record(CallOutcome::Success, FAST);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let cb = Arc::new(CircuitBreaker::new("svc", config(1000, 100.0, 1)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(cb.admit());
                        cb.record(CallOutcome::Success, FAST);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.buffered_calls, 800);
        assert_eq!(snapshot.successful_calls, 800);
        assert_eq!(snapshot.admitted_calls, 800);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_admission_frees_its_slot() {
        let cb = Arc::new(CircuitBreaker::new("svc", config(1, 50.0, 1)));
        fail(&cb, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = cb.try_acquire().expect("first trial admitted");
        assert!(cb.try_acquire().is_none());
        drop(trial);
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        let trial = cb.try_acquire().expect("slot was handed back");
        trial.record(CallOutcome::Success, FAST);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_admission_does_not_free_a_newer_trial_slot() {
        let cb = Arc::new(CircuitBreaker::new("svc", config(1, 50.0, 1)));
        let stale = cb.try_acquire().expect("closed admits");
        fail(&cb, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        let _trial = cb.try_acquire().expect("trial admitted");
        drop(stale);
        assert!(cb.try_acquire().is_none());
    }

    #[test]
    fn test_recorded_admission_counts_once() {
        let cb = Arc::new(CircuitBreaker::new("svc", config(4, 100.0, 1)));
        cb.try_acquire()
            .expect("closed admits")
            .record(CallOutcome::Failure, FAST);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.failed_calls, 1);
        assert_eq!(snapshot.buffered_calls, 1);
    }

    #[test]
    fn test_registry_lazily_creates_one_breaker_per_route() {
        let mut profiles = std::collections::HashMap::new();
        profiles.insert("auth".to_string(), CircuitBreakerConfig::auth_profile());
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), profiles);

        let a = registry.get("items");
        let b = registry.get("items");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.config().sliding_window_size, 10);
        // a profile name is not a breaker key
        assert_eq!(registry.get("auth").config().sliding_window_size, 10);
        assert_eq!(
            registry
                .get_with_profile("user-auth", Some("auth"))
                .config()
                .sliding_window_size,
            5
        );
        assert_eq!(registry.snapshots().len(), 3);
    }

    #[test]
    fn test_breakers_sharing_a_profile_keep_separate_state() {
        let mut profiles = std::collections::HashMap::new();
        profiles.insert("auth".to_string(), config(2, 50.0, 1));
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), profiles);

        let identity = registry.get_with_profile("identity-service", Some("auth"));
        let user_auth = registry.get_with_profile("user-auth-service", Some("auth"));
        assert!(!Arc::ptr_eq(&identity, &user_auth));

        fail(&identity, 1);
        assert_eq!(identity.state(), BreakerState::Open);
        assert_eq!(user_auth.state(), BreakerState::Closed);
        assert!(user_auth.admit());
    }

    #[test]
    fn test_registry_reconfigure_resets_state() {
        let registry = CircuitBreakerRegistry::default();
        registry.reconfigure("svc", config(1, 100.0, 1));
        assert!(registry.admit("svc"));
        registry.record("svc", CallOutcome::Failure, FAST);
        assert_eq!(registry.get("svc").state(), BreakerState::Open);

        registry.reconfigure("svc", config(1, 100.0, 1));
        assert_eq!(registry.get("svc").state(), BreakerState::Closed);
        assert!(registry.admit("svc"));
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate("default").is_empty());
        let mut bad = config(0, 0.0, 0);
        bad.slow_call_rate_threshold = 150.0;
        assert_eq!(bad.validate("bad").len(), 4);
    }
}
