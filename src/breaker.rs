//! # Circuit Breaker
//!
//! Classic three-state circuit breaker (Closed, Open, HalfOpen) driven by a
//! time- and capacity-bounded window of call outcomes.
//!
//! Admission is a two-step permit flow: [`CircuitBreaker::allow`] hands out a
//! [`CallPermit`] or rejects with `BreakerOpen`, and the caller reports the
//! result through [`CircuitBreaker::record`]. State transitions are
//! linearizable: all bookkeeping lives behind one short mutex that is never
//! held across backend execution, and permits carry the generation they were
//! admitted under so an outcome that arrives after a transition cannot
//! corrupt trial accounting.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::BreakerSettings;
use crate::error::{HarnessError, Result};
use crate::events::{EventPublisher, StateChangeEvent};
use crate::metrics::BreakerMetrics;

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation - calls pass, failures accumulate in the window
    Closed = 0,
    /// Failure mode - calls are rejected without reaching the backend
    Open = 1,
    /// Testing recovery - a bounded number of trial calls are admitted
    HalfOpen = 2,
}

impl From<u8> for BreakerState {
    fn from(value: u8) -> Self {
        match value {
            0 => BreakerState::Closed,
            2 => BreakerState::HalfOpen,
            // Default to the safest state
            _ => BreakerState::Open,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl std::str::FromStr for BreakerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            _ => Err(format!("Invalid breaker state: {s}")),
        }
    }
}

/// Result of one protected call, as seen by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure,
    Timeout,
}

impl CallOutcome {
    /// Timeouts are recorded identically to application failures.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure | Self::Timeout)
    }
}

/// How half-open trials decide whether the circuit may close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfOpenPolicy {
    /// Every trial must succeed; the first trial failure reopens immediately
    AllTrialsSucceed,
    /// Trial failures are tolerated while the ratio among completed trials
    /// stays below the failure ratio threshold; crossing it reopens
    FailureRatioBelowThreshold,
}

/// Fixed-capacity, time-bounded record of call outcomes.
///
/// Owned exclusively by the breaker and mutated only through `record`.
/// Order-insensitive except for pruning by age.
#[derive(Debug)]
pub(crate) struct OutcomeWindow {
    entries: VecDeque<(Instant, CallOutcome)>,
    capacity: usize,
    max_age: Duration,
}

impl OutcomeWindow {
    pub(crate) fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            max_age,
        }
    }

    pub(crate) fn record(&mut self, outcome: CallOutcome, now: Instant) {
        self.prune(now);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((now, outcome));
    }

    pub(crate) fn prune(&mut self, now: Instant) {
        while let Some((recorded_at, _)) = self.entries.front() {
            if now.duration_since(*recorded_at) > self.max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Failures plus timeouts over all samples; `None` while empty
    pub(crate) fn failure_ratio(&self) -> Option<f64> {
        if self.entries.is_empty() {
            return None;
        }
        let failures = self
            .entries
            .iter()
            .filter(|(_, outcome)| outcome.is_failure())
            .count();
        Some(failures as f64 / self.entries.len() as f64)
    }

    pub(crate) fn reset(&mut self) {
        self.entries.clear();
    }
}

/// Admission token returned by [`CircuitBreaker::allow`].
///
/// Must be handed back through [`CircuitBreaker::record`] once the protected
/// call finishes. A trial permit dropped without an outcome (the caller was
/// cancelled mid-call) hands its half-open slot back so the breaker cannot
/// run out of admissible trials.
#[must_use]
#[derive(Debug)]
pub struct CallPermit {
    component: Arc<str>,
    admitted_under: BreakerState,
    generation: u64,
    inner: Weak<Mutex<BreakerInner>>,
    recorded: bool,
}

impl CallPermit {
    /// True when this permit occupies a half-open trial slot
    pub fn is_trial(&self) -> bool {
        self.admitted_under == BreakerState::HalfOpen
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.recorded || self.admitted_under != BreakerState::HalfOpen {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock();
        // Only the generation that issued this trial may reclaim its slot;
        // a transition has already reset trial accounting otherwise.
        if inner.generation == self.generation && inner.trials_admitted > 0 {
            inner.trials_admitted -= 1;
            warn!(
                component = %self.component,
                "🟡 Half-open trial abandoned without an outcome, slot reclaimed"
            );
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    window: OutcomeWindow,
    opened_at: Option<Instant>,
    /// Bumped on every transition; stale permits are filtered by it
    generation: u64,
    trials_admitted: u32,
    trials_completed: u32,
    trial_failures: u32,
    // Raw counters for metrics snapshots
    total_calls: u64,
    success_count: u64,
    failure_count: u64,
    timeout_count: u64,
    rejected_open: u64,
    total_duration: Duration,
}

/// Core circuit breaker with linearizable state management
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging, errors, and events
    name: Arc<str>,
    /// Lock-free mirror of the current state; written only under the lock
    state: AtomicU8,
    config: BreakerSettings,
    inner: Arc<Mutex<BreakerInner>>,
    events: EventPublisher,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for the named component
    pub fn new(name: impl Into<String>, config: BreakerSettings) -> Self {
        let name: Arc<str> = name.into().into();
        info!(
            component = %name,
            failure_ratio_threshold = config.failure_ratio_threshold,
            minimum_samples = config.minimum_samples,
            open_duration_ms = config.open_duration_ms,
            half_open_trial_count = config.half_open_trial_count,
            "🛡️ Circuit breaker initialized"
        );

        let window = OutcomeWindow::new(config.window_capacity, config.window_duration());
        Self {
            name,
            state: AtomicU8::new(BreakerState::Closed as u8),
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                window,
                opened_at: None,
                generation: 0,
                trials_admitted: 0,
                trials_completed: 0,
                trial_failures: 0,
                total_calls: 0,
                success_count: 0,
                failure_count: 0,
                timeout_count: 0,
                rejected_open: 0,
                total_duration: Duration::ZERO,
            })),
            events: EventPublisher::default(),
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> BreakerState {
        BreakerState::from(self.state.load(Ordering::Acquire))
    }

    /// Get component name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to state transitions from this point onward
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateChangeEvent> {
        self.events.subscribe()
    }

    /// Decide whether a call may proceed.
    ///
    /// Returns a permit to hand back through [`record`](Self::record), or
    /// `BreakerOpen` when the circuit is open (or half-open with its trial
    /// budget spent). An expired open interval transitions to half-open here,
    /// with the transitioning caller admitted as the first trial.
    pub fn allow(&self) -> Result<CallPermit> {
        let mut inner = self.inner.lock();
        match self.state() {
            BreakerState::Closed => Ok(self.issue_permit(BreakerState::Closed, inner.generation)),
            BreakerState::Open => {
                let open_elapsed = match inner.opened_at {
                    Some(opened_at) => opened_at.elapsed() >= self.config.open_duration(),
                    None => {
                        // Open with no timestamp should be impossible; treat
                        // the interval as expired rather than wedging shut.
                        warn!(component = %self.name, "Circuit open but no timestamp recorded");
                        true
                    }
                };
                if open_elapsed {
                    self.transition_to_half_open(&mut inner);
                    inner.trials_admitted = 1;
                    Ok(self.issue_permit(BreakerState::HalfOpen, inner.generation))
                } else {
                    inner.rejected_open += 1;
                    Err(HarnessError::BreakerOpen {
                        component: self.name.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trials_admitted < self.config.half_open_trial_count {
                    inner.trials_admitted += 1;
                    Ok(self.issue_permit(BreakerState::HalfOpen, inner.generation))
                } else {
                    // Extra callers must not flood the recovering dependency
                    inner.rejected_open += 1;
                    Err(HarnessError::BreakerOpen {
                        component: self.name.to_string(),
                    })
                }
            }
        }
    }

    fn issue_permit(&self, admitted_under: BreakerState, generation: u64) -> CallPermit {
        CallPermit {
            component: Arc::clone(&self.name),
            admitted_under,
            generation,
            inner: Arc::downgrade(&self.inner),
            recorded: false,
        }
    }

    /// Record the outcome of a permitted call.
    ///
    /// Outcomes from permits issued before the latest transition still land
    /// in the counters but are excluded from window and trial bookkeeping.
    pub fn record(&self, mut permit: CallPermit, outcome: CallOutcome, latency: Duration) {
        permit.recorded = true;
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_duration += latency;
        match outcome {
            CallOutcome::Success => inner.success_count += 1,
            CallOutcome::Failure => inner.failure_count += 1,
            CallOutcome::Timeout => inner.timeout_count += 1,
        }

        if outcome.is_failure() {
            debug!(
                component = %self.name,
                outcome = ?outcome,
                latency_ms = latency.as_millis(),
                "🔴 Call failed"
            );
        } else {
            debug!(
                component = %self.name,
                latency_ms = latency.as_millis(),
                "🟢 Call succeeded"
            );
        }

        if permit.generation != inner.generation {
            debug!(
                component = %self.name,
                admitted_under = %permit.admitted_under,
                "Outcome from a previous breaker generation, skipping transition logic"
            );
            return;
        }

        let now = Instant::now();
        inner.window.record(outcome, now);

        match permit.admitted_under {
            BreakerState::Closed => {
                inner.window.prune(now);
                if inner.window.len() >= self.config.minimum_samples {
                    if let Some(ratio) = inner.window.failure_ratio() {
                        if ratio >= self.config.failure_ratio_threshold {
                            self.transition_to_open(&mut inner, BreakerState::Closed, ratio);
                        }
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.trials_completed += 1;
                if outcome.is_failure() {
                    inner.trial_failures += 1;
                }
                self.evaluate_trials(&mut inner);
            }
            BreakerState::Open => {
                // Permits are never issued while open; generation match makes
                // this unreachable, but record defensively like any outcome.
                warn!(component = %self.name, "Outcome recorded for an open-state permit");
            }
        }
    }

    fn evaluate_trials(&self, inner: &mut BreakerInner) {
        let completed = inner.trials_completed;
        let failures = inner.trial_failures;
        match self.config.half_open_policy {
            HalfOpenPolicy::AllTrialsSucceed => {
                if failures > 0 {
                    self.transition_to_open(&mut *inner, BreakerState::HalfOpen, 1.0);
                } else if completed >= self.config.half_open_trial_count {
                    self.transition_to_closed(inner);
                }
            }
            HalfOpenPolicy::FailureRatioBelowThreshold => {
                let ratio = f64::from(failures) / f64::from(completed.max(1));
                if ratio >= self.config.failure_ratio_threshold {
                    self.transition_to_open(&mut *inner, BreakerState::HalfOpen, ratio);
                } else if completed >= self.config.half_open_trial_count {
                    self.transition_to_closed(inner);
                }
            }
        }
    }

    /// Force circuit to open state (operator escape hatch)
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        let from = self.state();
        if from != BreakerState::Open {
            self.transition_to_open(&mut inner, from, f64::NAN);
        } else {
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Force circuit to closed state (operator escape hatch)
    pub fn force_close(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        if self.state() != BreakerState::Closed {
            self.transition_to_closed(&mut inner);
        }
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> BreakerMetrics {
        let mut inner = self.inner.lock();
        inner.window.prune(Instant::now());
        BreakerMetrics {
            total_calls: inner.total_calls,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            timeout_count: inner.timeout_count,
            rejected_open: inner.rejected_open,
            total_duration: inner.total_duration,
            current_state: self.state(),
            window_samples: inner.window.len(),
            window_failure_ratio: inner.window.failure_ratio(),
            ..Default::default()
        }
        .finalize()
    }

    fn transition_to_open(&self, inner: &mut BreakerInner, from: BreakerState, ratio: f64) {
        self.state.store(BreakerState::Open as u8, Ordering::Release);
        inner.generation += 1;
        inner.opened_at = Some(Instant::now());
        inner.trials_admitted = 0;
        inner.trials_completed = 0;
        inner.trial_failures = 0;

        error!(
            component = %self.name,
            from = %from,
            failure_ratio = ratio,
            open_duration_ms = self.config.open_duration_ms,
            "🔴 Circuit breaker opened (failing fast)"
        );
        self.events
            .publish(StateChangeEvent::new(self.name.as_ref(), from, BreakerState::Open));
    }

    fn transition_to_half_open(&self, inner: &mut BreakerInner) {
        self.state
            .store(BreakerState::HalfOpen as u8, Ordering::Release);
        inner.generation += 1;
        inner.trials_admitted = 0;
        inner.trials_completed = 0;
        inner.trial_failures = 0;

        info!(
            component = %self.name,
            half_open_trial_count = self.config.half_open_trial_count,
            "🟡 Circuit breaker half-open (testing recovery)"
        );
        self.events.publish(StateChangeEvent::new(
            self.name.as_ref(),
            BreakerState::Open,
            BreakerState::HalfOpen,
        ));
    }

    fn transition_to_closed(&self, inner: &mut BreakerInner) {
        let from = self.state();
        self.state
            .store(BreakerState::Closed as u8, Ordering::Release);
        inner.generation += 1;
        inner.opened_at = None;
        inner.window.reset();
        inner.trials_admitted = 0;
        inner.trials_completed = 0;
        inner.trial_failures = 0;

        info!(
            component = %self.name,
            total_calls = inner.total_calls,
            "🟢 Circuit breaker closed (recovered)"
        );
        self.events
            .publish(StateChangeEvent::new(self.name.as_ref(), from, BreakerState::Closed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::time::sleep;

    fn fast_settings() -> BreakerSettings {
        BreakerSettings {
            failure_ratio_threshold: 0.5,
            minimum_samples: 4,
            open_duration_ms: 50,
            half_open_trial_count: 2,
            window_duration_ms: 60_000,
            window_capacity: 32,
            half_open_policy: HalfOpenPolicy::AllTrialsSucceed,
        }
    }

    fn drive(breaker: &CircuitBreaker, outcome: CallOutcome) {
        let permit = breaker.allow().expect("call should be admitted");
        breaker.record(permit, outcome, Duration::from_millis(5));
    }

    #[test]
    fn test_starts_closed_and_admits() {
        let breaker = CircuitBreaker::new("test", fast_settings());
        assert_eq!(breaker.state(), BreakerState::Closed);
        drive(&breaker, CallOutcome::Success);

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
    }

    #[test]
    fn test_opens_at_failure_ratio_threshold() {
        let breaker = CircuitBreaker::new("test", fast_settings());

        // fail, fail, success, fail => ratio 0.75 >= 0.5 on the 4th outcome
        drive(&breaker, CallOutcome::Failure);
        drive(&breaker, CallOutcome::Failure);
        drive(&breaker, CallOutcome::Success);
        assert_eq!(breaker.state(), BreakerState::Closed);
        drive(&breaker, CallOutcome::Failure);
        assert_eq!(breaker.state(), BreakerState::Open);

        // The very next allow rejects without consuming trial budget
        let err = breaker.allow().unwrap_err();
        assert!(matches!(err, HarnessError::BreakerOpen { .. }));
        assert_eq!(breaker.metrics().rejected_open, 1);
    }

    #[test]
    fn test_minimum_samples_gate() {
        let breaker = CircuitBreaker::new("test", fast_settings());

        // Three straight failures: ratio 1.0 but only 3 of 4 required samples
        drive(&breaker, CallOutcome::Failure);
        drive(&breaker, CallOutcome::Failure);
        drive(&breaker, CallOutcome::Failure);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_timeouts_count_as_failures() {
        let breaker = CircuitBreaker::new("test", fast_settings());
        drive(&breaker, CallOutcome::Timeout);
        drive(&breaker, CallOutcome::Timeout);
        drive(&breaker, CallOutcome::Success);
        drive(&breaker, CallOutcome::Timeout);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_open_transitions_to_half_open_after_duration() {
        let settings = BreakerSettings {
            half_open_trial_count: 1,
            ..fast_settings()
        };
        let breaker = CircuitBreaker::new("test", settings);
        for _ in 0..4 {
            drive(&breaker, CallOutcome::Failure);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.allow().is_err());

        sleep(Duration::from_millis(60)).await;

        // First allow after the interval is admitted as the sole trial
        let permit = breaker.allow().expect("trial should be admitted");
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(permit.is_trial());

        // Second concurrent caller exceeds the trial budget
        assert!(breaker.allow().is_err());

        breaker.record(permit, CallOutcome::Success, Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_trial_permit_releases_its_slot() {
        let settings = BreakerSettings {
            half_open_trial_count: 1,
            ..fast_settings()
        };
        let breaker = CircuitBreaker::new("test", settings);
        for _ in 0..4 {
            drive(&breaker, CallOutcome::Failure);
        }
        sleep(Duration::from_millis(60)).await;

        // The sole trial is abandoned mid-call (caller cancelled)
        let abandoned = breaker.allow().expect("trial should be admitted");
        assert!(abandoned.is_trial());
        assert!(breaker.allow().is_err());
        drop(abandoned);

        // The reclaimed slot admits a fresh trial that can close the circuit
        let retry = breaker.allow().expect("reclaimed slot should admit a trial");
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record(retry, CallOutcome::Success, Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_stale_trial_permit_drop_does_not_cross_generations() {
        let breaker = CircuitBreaker::new("test", fast_settings());
        for _ in 0..4 {
            drive(&breaker, CallOutcome::Failure);
        }
        sleep(Duration::from_millis(60)).await;

        let first = breaker.allow().unwrap();
        let straggler = breaker.allow().unwrap();
        breaker.record(first, CallOutcome::Failure, Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::Open);

        // Dropping a permit from the previous half-open generation must not
        // disturb the reopened circuit's trial accounting
        drop(straggler);
        assert_eq!(breaker.state(), BreakerState::Open);
        let err = breaker.allow().unwrap_err();
        assert!(matches!(err, HarnessError::BreakerOpen { .. }));
    }

    #[tokio::test]
    async fn test_trial_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new("test", fast_settings());
        for _ in 0..4 {
            drive(&breaker, CallOutcome::Failure);
        }
        sleep(Duration::from_millis(60)).await;

        let first = breaker.allow().unwrap();
        let second = breaker.allow().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record(first, CallOutcome::Failure, Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::Open);

        // The straggling trial's outcome is stale and cannot close the circuit
        breaker.record(second, CallOutcome::Success, Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_all_trials_succeed_closes_and_resets_window() {
        let breaker = CircuitBreaker::new("test", fast_settings());
        for _ in 0..4 {
            drive(&breaker, CallOutcome::Failure);
        }
        sleep(Duration::from_millis(60)).await;

        let first = breaker.allow().unwrap();
        let second = breaker.allow().unwrap();
        breaker.record(first, CallOutcome::Success, Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record(second, CallOutcome::Success, Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::Closed);

        // Window was reset on close; old failures no longer count
        assert_eq!(breaker.metrics().window_samples, 0);
    }

    #[tokio::test]
    async fn test_ratio_policy_tolerates_minority_trial_failures() {
        let settings = BreakerSettings {
            half_open_trial_count: 4,
            half_open_policy: HalfOpenPolicy::FailureRatioBelowThreshold,
            ..fast_settings()
        };
        let breaker = CircuitBreaker::new("test", settings);
        for _ in 0..4 {
            drive(&breaker, CallOutcome::Failure);
        }
        sleep(Duration::from_millis(60)).await;

        let permits: Vec<_> = (0..4).map(|_| breaker.allow().unwrap()).collect();
        let mut permits = permits.into_iter();

        breaker.record(
            permits.next().unwrap(),
            CallOutcome::Success,
            Duration::from_millis(5),
        );
        breaker.record(
            permits.next().unwrap(),
            CallOutcome::Success,
            Duration::from_millis(5),
        );
        breaker.record(
            permits.next().unwrap(),
            CallOutcome::Failure,
            Duration::from_millis(5),
        );
        // 1 failure over 3 completed trials: 0.33 < 0.5, still half-open
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record(
            permits.next().unwrap(),
            CallOutcome::Success,
            Duration::from_millis(5),
        );
        // 1 failure over 4 trials: 0.25 < 0.5, circuit closes
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_transition_events_are_published() {
        let breaker = CircuitBreaker::new("test", fast_settings());
        let mut rx = breaker.subscribe();

        for _ in 0..4 {
            drive(&breaker, CallOutcome::Failure);
        }

        let event = rx.recv().await.unwrap();
        assert_eq!(event.component, "test");
        assert_eq!(event.from, BreakerState::Closed);
        assert_eq!(event.to, BreakerState::Open);
    }

    #[test]
    fn test_force_operations() {
        let breaker = CircuitBreaker::new("test", fast_settings());

        breaker.force_open();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.allow().is_err());

        breaker.force_close();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn test_stale_closed_permit_does_not_feed_window() {
        let breaker = CircuitBreaker::new("test", fast_settings());

        // Admit a call, then force a transition before its outcome arrives
        let stale = breaker.allow().unwrap();
        breaker.force_open();
        breaker.force_close();

        breaker.record(stale, CallOutcome::Failure, Duration::from_millis(5));
        let metrics = breaker.metrics();
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.window_samples, 0);
    }

    #[test]
    fn test_window_prunes_by_age() {
        let mut window = OutcomeWindow::new(8, Duration::from_millis(10));
        let old = Instant::now();
        window.record(CallOutcome::Failure, old);
        std::thread::sleep(Duration::from_millis(20));
        window.prune(Instant::now());
        assert_eq!(window.len(), 0);
        assert_eq!(window.failure_ratio(), None);
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(BreakerState::HalfOpen.to_string(), "half_open");
        assert_eq!("open".parse::<BreakerState>().unwrap(), BreakerState::Open);
        assert!("bogus".parse::<BreakerState>().is_err());
    }

    proptest! {
        #[test]
        fn prop_window_respects_capacity_and_ratio_bounds(
            outcomes in prop::collection::vec(0u8..3, 0..200)
        ) {
            let mut window = OutcomeWindow::new(64, Duration::from_secs(60));
            let now = Instant::now();
            for raw in outcomes {
                let outcome = match raw {
                    0 => CallOutcome::Success,
                    1 => CallOutcome::Failure,
                    _ => CallOutcome::Timeout,
                };
                window.record(outcome, now);
                prop_assert!(window.len() <= 64);
                if let Some(ratio) = window.failure_ratio() {
                    prop_assert!((0.0..=1.0).contains(&ratio));
                }
            }
        }

        #[test]
        fn prop_breaker_never_admits_more_trials_than_budget(
            trial_count in 1u32..8
        ) {
            let settings = BreakerSettings {
                half_open_trial_count: trial_count,
                open_duration_ms: 1,
                ..BreakerSettings::default()
            };
            let breaker = CircuitBreaker::new("prop", settings);
            breaker.force_open();
            std::thread::sleep(Duration::from_millis(2));

            // Permits are held alive; a dropped trial would hand its slot back
            let mut held = Vec::new();
            for _ in 0..(trial_count * 2) {
                if let Ok(permit) = breaker.allow() {
                    held.push(permit);
                }
            }
            prop_assert_eq!(held.len() as u32, trial_count);
        }
    }
}
