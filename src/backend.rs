//! # Degrading Backend
//!
//! Simulated backing dependency whose behavior worsens with use. Every call
//! leaks a fixed number of resource units that are never returned until an
//! explicit reset; effective latency grows with the leak and clamps at a
//! configured maximum; once the leak reaches capacity the pool is exhausted
//! and every call times out deterministically. Error probability rises with
//! concurrent load, reproducing a dependency that falls over past a
//! concurrency cliff.
//!
//! The failure draw comes from a single RNG sample per invocation; seeding
//! the RNG makes a whole scenario reproducible. Invalid degradation knobs
//! are never rejected - the backend fails closed instead (a zero
//! `leak_capacity` starts exhausted, a zero `concurrency_cliff` pins the
//! error probability at 1).

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::config::BackendSettings;
use crate::error::{HarnessError, Result};

/// Whether simulated latency is actually slept for or only reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMode {
    /// Sleep for the effective latency, as a live dependency would
    Real,
    /// Report the effective latency without sleeping (fast tests)
    Simulated,
}

/// Request passed through the harness to the backing service
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub payload: String,
}

impl BackendRequest {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Response from the backing service, carrying the latency it simulated
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub payload: String,
    pub latency: Duration,
}

/// Point-in-time view of the backend's degradation state
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DegradationProfile {
    pub calls_served: u64,
    pub leaked_units: u64,
    pub in_flight: u64,
    pub effective_latency: Duration,
    pub effective_error_probability: f64,
}

/// Call interface shared by the degrading backend and test doubles.
///
/// `invoke` is the live-traffic path and advances the degradation profile;
/// `probe` is the read-style path used by out-of-band health checks and
/// must not advance it.
#[async_trait]
pub trait BackingService: Send + Sync {
    async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse>;
    async fn probe(&self) -> Result<BackendResponse>;
}

/// Simulated dependency with leak-driven latency and load-driven errors
pub struct DegradingBackend {
    settings: BackendSettings,
    calls_served: AtomicU64,
    leaked_units: AtomicU64,
    in_flight: AtomicU64,
    rng: Mutex<StdRng>,
}

impl DegradingBackend {
    pub fn new(settings: BackendSettings) -> Self {
        info!(
            baseline_latency_ms = settings.baseline_latency_ms,
            baseline_error_probability = settings.baseline_error_probability,
            leak_capacity = settings.leak_capacity,
            concurrency_cliff = settings.concurrency_cliff,
            latency_mode = ?settings.latency_mode,
            "🧪 Degrading backend initialized"
        );
        let rng = match settings.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            settings,
            calls_served: AtomicU64::new(0),
            leaked_units: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            rng: Mutex::new(rng),
        }
    }

    /// Snapshot the current degradation state
    pub fn profile(&self) -> DegradationProfile {
        let leaked = self.leaked_units.load(Ordering::Relaxed);
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        DegradationProfile {
            calls_served: self.calls_served.load(Ordering::Relaxed),
            leaked_units: leaked,
            in_flight,
            effective_latency: self.effective_latency(leaked),
            effective_error_probability: self.effective_error_probability(in_flight),
        }
    }

    /// Reset the degradation profile (test setup). In-flight accounting is
    /// live state and is left untouched.
    pub fn reset(&self) {
        info!("🔄 Degrading backend reset");
        self.calls_served.store(0, Ordering::Relaxed);
        self.leaked_units.store(0, Ordering::Relaxed);
    }

    /// `L0 * (1 + leaked / leak_capacity)`, clamped to the maximum
    fn effective_latency(&self, leaked_units: u64) -> Duration {
        let max = self.settings.max_latency();
        if self.settings.leak_capacity == 0 {
            return max;
        }
        let factor = 1.0 + leaked_units as f64 / self.settings.leak_capacity as f64;
        let latency = self.settings.baseline_latency().mul_f64(factor);
        latency.min(max)
    }

    /// `min(1, P0 + in_flight / concurrency_cliff)`
    fn effective_error_probability(&self, in_flight: u64) -> f64 {
        if self.settings.concurrency_cliff == 0 {
            return 1.0;
        }
        let load = in_flight as f64 / self.settings.concurrency_cliff as f64;
        (self.settings.baseline_error_probability + load).min(1.0)
    }

    fn exhausted(&self, leaked_before_call: u64) -> bool {
        leaked_before_call >= self.settings.leak_capacity
    }

    async fn simulate_latency(&self, latency: Duration) {
        if self.settings.latency_mode == LatencyMode::Real {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BackingService for DegradingBackend {
    async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse> {
        let _guard = InFlightGuard::enter(&self.in_flight);
        let in_flight_now = self.in_flight.load(Ordering::Relaxed);

        self.calls_served.fetch_add(1, Ordering::Relaxed);
        let leaked_before = self
            .leaked_units
            .fetch_add(self.settings.leak_increment, Ordering::Relaxed);
        let leaked_now = leaked_before + self.settings.leak_increment;

        // Exhausted pool: deterministic timeout, no draw
        if self.exhausted(leaked_before) {
            let latency = self.settings.max_latency();
            debug!(
                leaked_units = leaked_now,
                leak_capacity = self.settings.leak_capacity,
                "⏱️ Simulated pool exhausted, call times out"
            );
            self.simulate_latency(latency).await;
            return Err(HarnessError::BackendTimeout { latency });
        }

        let latency = self.effective_latency(leaked_now);
        let error_probability = self.effective_error_probability(in_flight_now);
        let draw: f64 = self.rng.lock().gen();

        trace!(
            in_flight = in_flight_now,
            leaked_units = leaked_now,
            latency_ms = latency.as_millis(),
            error_probability,
            "Serving backend call"
        );

        self.simulate_latency(latency).await;

        if draw < error_probability {
            debug!(
                in_flight = in_flight_now,
                error_probability, "💥 Injected backend failure"
            );
            Err(HarnessError::BackendError {
                message: "injected fault from degrading backing service".to_string(),
                latency,
            })
        } else {
            Ok(BackendResponse {
                payload: request.payload,
                latency,
            })
        }
    }

    /// Read-style invocation for health probes: observes the current curves
    /// and draws against the current error probability without advancing
    /// `calls_served`, `leaked_units`, or the in-flight count.
    async fn probe(&self) -> Result<BackendResponse> {
        let leaked = self.leaked_units.load(Ordering::Relaxed);
        if self.exhausted(leaked) {
            let latency = self.settings.max_latency();
            self.simulate_latency(latency).await;
            return Err(HarnessError::BackendTimeout { latency });
        }

        let latency = self.effective_latency(leaked);
        let error_probability =
            self.effective_error_probability(self.in_flight.load(Ordering::Relaxed));
        let draw: f64 = self.rng.lock().gen();

        self.simulate_latency(latency).await;

        if draw < error_probability {
            Err(HarnessError::BackendError {
                message: "probe hit injected fault".to_string(),
                latency,
            })
        } else {
            Ok(BackendResponse {
                payload: "probe".to_string(),
                latency,
            })
        }
    }
}

impl std::fmt::Debug for DegradingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradingBackend")
            .field("settings", &self.settings)
            .field("profile", &self.profile())
            .finish()
    }
}

/// Scoped in-flight counter: increments on entry, decrements on every exit
/// path including cancellation during the simulated sleep.
struct InFlightGuard<'a> {
    counter: &'a AtomicU64,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
