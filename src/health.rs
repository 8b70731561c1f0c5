//! # Health Aggregator
//!
//! Out-of-band prober estimating the backing service's health independent of
//! live traffic. Each scheduled tick issues one probe directly against the
//! backend - bypassing the bulkhead and the circuit breaker, since a health
//! check must observe raw backend state. The simulated health indicator is
//! unreliable, so a probe gets a retry budget: a sample is only recorded as
//! failed after every raw attempt in the budget fails consecutively.
//!
//! Samples live in a rolling window pruned by age and capacity; the healthy
//! flag flips to false once the window's failure ratio exceeds the
//! configured threshold and is readable without locking.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::BackingService;
use crate::config::HealthSettings;

/// Retry delay shape between raw probe attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed,
    Exponential,
}

/// Delay before retry attempt `attempt` (1-based). Exponential growth is
/// capped at `max`; no jitter, so seeded scenarios stay reproducible.
pub(crate) fn retry_delay(
    policy: BackoffPolicy,
    attempt: u32,
    base: Duration,
    max: Duration,
) -> Duration {
    match policy {
        BackoffPolicy::Fixed => base,
        BackoffPolicy::Exponential => {
            let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
            base.saturating_mul(multiplier).min(max)
        }
    }
}

/// A single probe result
#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    pub taken_at: DateTime<Utc>,
    pub latency: Duration,
    pub healthy: bool,
    /// Raw attempts spent on this sample (1 on first-try success)
    pub attempts: u32,
}

/// Point-in-time health view for an external health-check endpoint
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    /// Failed samples over the rolling window; 0 while the window is empty
    pub failure_ratio: f64,
    pub sample_count: usize,
}

/// Rolling prober with a smoothed healthy signal
pub struct HealthAggregator {
    backend: Arc<dyn BackingService>,
    settings: HealthSettings,
    samples: Mutex<VecDeque<(Instant, HealthSample)>>,
    healthy: AtomicBool,
}

impl HealthAggregator {
    pub fn new(backend: Arc<dyn BackingService>, settings: HealthSettings) -> Self {
        Self {
            backend,
            settings,
            samples: Mutex::new(VecDeque::new()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Lock-free read of the smoothed health signal
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Snapshot the current signal and window statistics
    pub fn snapshot(&self) -> HealthSnapshot {
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, self.settings.window_duration(), Instant::now());
        let failure_ratio = Self::failure_ratio(&samples);
        HealthSnapshot {
            healthy: self.healthy.load(Ordering::Acquire),
            failure_ratio,
            sample_count: samples.len(),
        }
    }

    /// Run the periodic probe schedule until a shutdown signal arrives.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            probe_interval_ms = self.settings.probe_interval_ms,
            retry_budget = self.settings.retry_budget,
            "🩺 Health monitor starting"
        );

        let mut ticker = tokio::time::interval(self.settings.probe_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_and_record().await;
                }
                _ = shutdown.recv() => {
                    info!("🩺 Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Issue one probe (with its retry budget) and record the sample.
    /// Exposed so tests and callers can tick the schedule manually.
    pub async fn probe_and_record(&self) -> HealthSample {
        let sample = self.probe_once().await;
        self.record_sample(sample.clone());
        sample
    }

    /// One scheduled probe: up to `retry_budget` raw attempts, backing off
    /// between them. Succeeds on the first raw success.
    async fn probe_once(&self) -> HealthSample {
        let budget = self.settings.retry_budget;
        let started = Instant::now();

        for attempt in 1..=budget {
            match self.backend.probe().await {
                Ok(response) => {
                    debug!(
                        attempt,
                        latency_ms = response.latency.as_millis(),
                        "🩺 Probe succeeded"
                    );
                    return HealthSample {
                        taken_at: Utc::now(),
                        latency: response.latency,
                        healthy: true,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    debug!(attempt, budget, %error, "🩺 Raw probe attempt failed");
                    if attempt < budget {
                        let delay = retry_delay(
                            self.settings.backoff,
                            attempt,
                            self.settings.backoff_base(),
                            self.settings.backoff_max(),
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        warn!(
            budget,
            elapsed_ms = started.elapsed().as_millis(),
            "🩺 Probe failed after exhausting retry budget"
        );
        HealthSample {
            taken_at: Utc::now(),
            latency: started.elapsed(),
            healthy: false,
            attempts: budget,
        }
    }

    fn record_sample(&self, sample: HealthSample) {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, self.settings.window_duration(), now);
        if samples.len() == self.settings.window_capacity {
            samples.pop_front();
        }
        samples.push_back((now, sample));

        let failure_ratio = Self::failure_ratio(&samples);
        let healthy = failure_ratio <= self.settings.unhealthy_ratio_threshold;
        let was_healthy = self.healthy.swap(healthy, Ordering::Release);
        if was_healthy != healthy {
            if healthy {
                info!(failure_ratio, "🩺 Backend health recovered");
            } else {
                warn!(failure_ratio, "🩺 Backend declared unhealthy");
            }
        }
    }

    fn prune(
        samples: &mut VecDeque<(Instant, HealthSample)>,
        max_age: Duration,
        now: Instant,
    ) {
        while let Some((taken_at, _)) = samples.front() {
            if now.duration_since(*taken_at) > max_age {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_ratio(samples: &VecDeque<(Instant, HealthSample)>) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let failures = samples
            .iter()
            .filter(|(_, sample)| !sample.healthy)
            .count();
        failures as f64 / samples.len() as f64
    }
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("settings", &self.settings)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendRequest, BackendResponse};
    use crate::error::{HarnessError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Probe double that fails for a scripted number of raw attempts before
    /// succeeding (usize::MAX = never succeed).
    struct FlakyProbeService {
        failures_before_success: usize,
        raw_probes: AtomicUsize,
    }

    impl FlakyProbeService {
        fn new(failures_before_success: usize) -> Self {
            Self {
                failures_before_success,
                raw_probes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BackingService for FlakyProbeService {
        async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse> {
            Ok(BackendResponse {
                payload: request.payload,
                latency: Duration::from_millis(1),
            })
        }

        async fn probe(&self) -> Result<BackendResponse> {
            let seen = self.raw_probes.fetch_add(1, Ordering::SeqCst);
            if seen < self.failures_before_success {
                Err(HarnessError::BackendError {
                    message: "flaky".to_string(),
                    latency: Duration::from_millis(1),
                })
            } else {
                Ok(BackendResponse {
                    payload: "probe".to_string(),
                    latency: Duration::from_millis(1),
                })
            }
        }
    }

    fn fast_settings() -> HealthSettings {
        HealthSettings {
            probe_interval_ms: 10,
            retry_budget: 3,
            backoff: BackoffPolicy::Fixed,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            window_duration_ms: 60_000,
            window_capacity: 16,
            unhealthy_ratio_threshold: 0.5,
        }
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let base = Duration::from_millis(50);
        let max = Duration::from_millis(300);
        assert_eq!(
            retry_delay(BackoffPolicy::Exponential, 1, base, max),
            Duration::from_millis(50)
        );
        assert_eq!(
            retry_delay(BackoffPolicy::Exponential, 2, base, max),
            Duration::from_millis(100)
        );
        assert_eq!(
            retry_delay(BackoffPolicy::Exponential, 3, base, max),
            Duration::from_millis(200)
        );
        assert_eq!(
            retry_delay(BackoffPolicy::Exponential, 4, base, max),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let base = Duration::from_millis(20);
        let max = Duration::from_millis(300);
        for attempt in 1..6 {
            assert_eq!(retry_delay(BackoffPolicy::Fixed, attempt, base, max), base);
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_absorbed_by_retry_budget() {
        // 2 raw failures, then success: within a budget of 3
        let backend = Arc::new(FlakyProbeService::new(2));
        let aggregator = HealthAggregator::new(backend, fast_settings());

        let sample = aggregator.probe_and_record().await;
        assert!(sample.healthy);
        assert_eq!(sample.attempts, 3);
        assert!(aggregator.is_healthy());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_records_single_failed_sample() {
        let backend = Arc::new(FlakyProbeService::new(usize::MAX));
        let aggregator = HealthAggregator::new(backend, fast_settings());

        let sample = aggregator.probe_and_record().await;
        assert!(!sample.healthy);
        assert_eq!(sample.attempts, 3);

        // Ratio 1.0 > 0.5 threshold
        let snapshot = aggregator.snapshot();
        assert!(!snapshot.healthy);
        assert_eq!(snapshot.sample_count, 1);
        assert!((snapshot.failure_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_healthy_signal_recovers_as_window_fills() {
        let backend = Arc::new(FlakyProbeService::new(3));
        let mut settings = fast_settings();
        settings.retry_budget = 1;
        let aggregator = HealthAggregator::new(backend, settings);

        // Three failed samples (budget 1 means no retries absorb them)
        for _ in 0..3 {
            aggregator.probe_and_record().await;
        }
        assert!(!aggregator.is_healthy());

        // Successes dilute the window below the 0.5 threshold
        for _ in 0..4 {
            aggregator.probe_and_record().await;
        }
        assert!(aggregator.is_healthy());
        let snapshot = aggregator.snapshot();
        assert!(snapshot.failure_ratio <= 0.5);
    }

    #[tokio::test]
    async fn test_window_capacity_evicts_oldest_samples() {
        let backend = Arc::new(FlakyProbeService::new(2));
        let mut settings = fast_settings();
        settings.retry_budget = 1;
        settings.window_capacity = 2;
        let aggregator = HealthAggregator::new(backend, settings);

        aggregator.probe_and_record().await; // fail
        aggregator.probe_and_record().await; // fail
        assert!(!aggregator.is_healthy());

        aggregator.probe_and_record().await; // success, evicts one failure
        aggregator.probe_and_record().await; // success, evicts the other
        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.sample_count, 2);
        assert!(snapshot.healthy);
        assert_eq!(snapshot.failure_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let backend = Arc::new(FlakyProbeService::new(0));
        let aggregator = Arc::new(HealthAggregator::new(backend, fast_settings()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(Arc::clone(&aggregator).run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(35)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        // Interval fires immediately, so several samples were recorded
        assert!(aggregator.snapshot().sample_count >= 2);
        assert!(aggregator.is_healthy());
    }
}
