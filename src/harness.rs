//! # Resiliency Harness
//!
//! Facade composing the bulkhead, circuit breaker, degrading backend, and
//! health aggregator behind a single call boundary. Every inbound call runs
//! Bulkhead admission → Breaker admission → Backend execution, with the
//! outcome fed back into the breaker; the bulkhead slot is released on every
//! exit path. The health monitor runs on its own timer, probing the backend
//! directly.
//!
//! Rejections fail fast: once the breaker is open, callers see `BreakerOpen`
//! without experiencing the backend's degraded latency. Retry policy belongs
//! to the caller - the harness never retries a live call internally.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{
    BackendRequest, BackendResponse, BackingService, DegradationProfile, DegradingBackend,
};
use crate::breaker::{BreakerState, CallOutcome, CircuitBreaker};
use crate::bulkhead::Bulkhead;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::events::StateChangeEvent;
use crate::health::{HealthAggregator, HealthSnapshot};
use crate::metrics::{BreakerMetrics, HarnessMetrics};

#[derive(Debug, Default)]
struct HarnessCounters {
    calls_total: AtomicU64,
    successes: AtomicU64,
    backend_errors: AtomicU64,
    backend_timeouts: AtomicU64,
    bulkhead_rejections: AtomicU64,
    breaker_rejections: AtomicU64,
}

impl HarnessCounters {
    fn snapshot(&self) -> HarnessMetrics {
        HarnessMetrics {
            calls_total: self.calls_total.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            backend_timeouts: self.backend_timeouts.load(Ordering::Relaxed),
            bulkhead_rejections: self.bulkhead_rejections.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
        }
    }
}

/// The composed resiliency test harness for one protected dependency
pub struct ResiliencyHarness {
    config: HarnessConfig,
    bulkhead: Bulkhead,
    breaker: CircuitBreaker,
    backend: Arc<DegradingBackend>,
    health: Arc<HealthAggregator>,
    counters: HarnessCounters,
    shutdown: broadcast::Sender<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ResiliencyHarness {
    /// Build a harness from validated configuration.
    ///
    /// Fails with `Configuration` when breaker, bulkhead, or health settings
    /// are invalid. The health monitor is not started here; call
    /// [`start_health_monitor`](Self::start_health_monitor) once the harness
    /// is in place.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;

        let backend = Arc::new(DegradingBackend::new(config.backend.clone()));
        let health = Arc::new(HealthAggregator::new(
            Arc::clone(&backend) as Arc<dyn BackingService>,
            config.health.clone(),
        ));
        let (shutdown, _) = broadcast::channel(1);

        info!(component = %config.component, "🧰 Resiliency harness initialized");
        Ok(Self {
            bulkhead: Bulkhead::new(config.component.clone(), &config.bulkhead),
            breaker: CircuitBreaker::new(config.component.clone(), config.breaker.clone()),
            backend,
            health,
            counters: HarnessCounters::default(),
            shutdown,
            monitor: Mutex::new(None),
            config,
        })
    }

    /// The single entry point composing bulkhead, breaker, and backend.
    pub async fn call(&self, request: BackendRequest) -> Result<BackendResponse> {
        self.counters.calls_total.fetch_add(1, Ordering::Relaxed);

        // Bulkhead admission; the permit's slot is released on every exit
        // path below via scope or explicit release.
        let mut permit = match self.bulkhead.acquire().await {
            Ok(permit) => permit,
            Err(rejection) => {
                self.counters
                    .bulkhead_rejections
                    .fetch_add(1, Ordering::Relaxed);
                return Err(rejection);
            }
        };

        // Breaker admission; a rejection here releases the slot on drop and
        // never reaches the backend.
        let call_permit = match self.breaker.allow() {
            Ok(call_permit) => call_permit,
            Err(rejection) => {
                self.counters
                    .breaker_rejections
                    .fetch_add(1, Ordering::Relaxed);
                debug!(component = %self.config.component, "Call short-circuited by breaker");
                return Err(rejection);
            }
        };

        let started = Instant::now();
        let result = self.backend.invoke(request).await;

        let (outcome, latency) = match &result {
            Ok(response) => (CallOutcome::Success, response.latency),
            Err(HarnessError::BackendTimeout { latency }) => (CallOutcome::Timeout, *latency),
            Err(HarnessError::BackendError { latency, .. }) => (CallOutcome::Failure, *latency),
            // The backend only produces the two faults above
            Err(_) => (CallOutcome::Failure, started.elapsed()),
        };
        self.breaker.record(call_permit, outcome, latency);

        match outcome {
            CallOutcome::Success => &self.counters.successes,
            CallOutcome::Failure => &self.counters.backend_errors,
            CallOutcome::Timeout => &self.counters.backend_timeouts,
        }
        .fetch_add(1, Ordering::Relaxed);

        permit.release()?;
        result
    }

    /// Spawn the periodic health monitor. Idempotent: a second call while
    /// the monitor is running is a no-op.
    pub fn start_health_monitor(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!(component = %self.config.component, "Health monitor already running");
            return;
        }
        let handle = tokio::spawn(Arc::clone(&self.health).run(self.shutdown.subscribe()));
        *monitor = Some(handle);
    }

    /// Signal the health monitor to stop. Safe to call when it never started.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Lazy stream of breaker transitions from this point onward
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.breaker.subscribe()
    }

    /// Point-in-time health signal and failure ratio
    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Smoothed health flag maintained by the out-of-band prober
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Manually tick the health schedule (useful in tests and scripted
    /// scenarios that do not run the background monitor).
    pub async fn probe_health(&self) {
        self.health.probe_and_record().await;
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn breaker_metrics(&self) -> BreakerMetrics {
        self.breaker.metrics()
    }

    pub fn metrics(&self) -> HarnessMetrics {
        self.counters.snapshot()
    }

    /// Current simulated degradation state of the backend
    pub fn degradation_profile(&self) -> DegradationProfile {
        self.backend.profile()
    }

    /// Reset the backend's degradation profile (test setup). Breaker and
    /// bulkhead state are process-lifetime and are not touched.
    pub fn reset(&self) {
        self.backend.reset();
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }
}

impl Drop for ResiliencyHarness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

impl std::fmt::Debug for ResiliencyHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencyHarness")
            .field("component", &self.config.component)
            .field("breaker_state", &self.breaker.state())
            .field("in_flight", &self.bulkhead.in_flight())
            .finish()
    }
}
