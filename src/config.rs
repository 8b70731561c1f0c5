//! # Harness Configuration
//!
//! All tuning knobs are supplied at construction time; nothing is mutated at
//! runtime. Configuration can be built directly in code, deserialized from a
//! YAML file, or overridden through `HARNESS_`-prefixed environment
//! variables. Explicit validation replaces silent fallbacks: invalid
//! breaker/bulkhead/health settings are fatal at construction, while backend
//! degradation knobs are deliberately never rejected - a zero `leak_capacity`
//! simply means the simulated dependency starts out exhausted and fails
//! closed.
//!
//! Durations are expressed as millisecond fields in the serialized form and
//! exposed as [`std::time::Duration`] through accessor methods.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::backend::LatencyMode;
use crate::breaker::HalfOpenPolicy;
use crate::error::{HarnessError, Result};
use crate::health::BackoffPolicy;

/// Root configuration for one protected dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Component name used in errors, logs, and state-change events
    pub component: String,
    pub breaker: BreakerSettings,
    pub bulkhead: BulkheadSettings,
    pub backend: BackendSettings,
    pub health: HealthSettings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            component: "backing_service".to_string(),
            breaker: BreakerSettings::default(),
            bulkhead: BulkheadSettings::default(),
            backend: BackendSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a YAML file with `HARNESS_`-prefixed
    /// environment overrides (e.g. `HARNESS_BULKHEAD__MAX_CONCURRENT=4`).
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("HARNESS").separator("__"))
            .build()
            .map_err(|e| HarnessError::Configuration(e.to_string()))?;

        let loaded: HarnessConfig = settings
            .try_deserialize()
            .map_err(|e| HarnessError::Configuration(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate all settings that must be rejected at construction time.
    pub fn validate(&self) -> Result<()> {
        if self.component.is_empty() {
            return Err(HarnessError::Configuration(
                "component name must not be empty".to_string(),
            ));
        }
        self.breaker.validate()?;
        self.bulkhead.validate()?;
        self.health.validate()?;
        Ok(())
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failure ratio (failures + timeouts over window samples) that opens
    /// the circuit; must be in (0, 1]
    pub failure_ratio_threshold: f64,
    /// Window samples required before the ratio is acted on
    pub minimum_samples: usize,
    /// How long the circuit stays open before a half-open transition
    pub open_duration_ms: u64,
    /// Concurrent trial calls admitted while half-open
    pub half_open_trial_count: u32,
    /// Age bound for outcome window entries
    pub window_duration_ms: u64,
    /// Capacity bound for the outcome window
    pub window_capacity: usize,
    /// How half-open trials decide whether to close
    pub half_open_policy: HalfOpenPolicy,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_ratio_threshold: 0.5,
            minimum_samples: 10,
            open_duration_ms: 30_000,
            half_open_trial_count: 3,
            window_duration_ms: 60_000,
            window_capacity: 128,
            half_open_policy: HalfOpenPolicy::AllTrialsSucceed,
        }
    }
}

impl BreakerSettings {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    fn validate(&self) -> Result<()> {
        if !(self.failure_ratio_threshold > 0.0 && self.failure_ratio_threshold <= 1.0) {
            return Err(HarnessError::Configuration(format!(
                "failure_ratio_threshold must be in (0, 1], got {}",
                self.failure_ratio_threshold
            )));
        }
        if self.minimum_samples == 0 {
            return Err(HarnessError::Configuration(
                "minimum_samples must be at least 1".to_string(),
            ));
        }
        if self.window_capacity < self.minimum_samples {
            return Err(HarnessError::Configuration(format!(
                "window_capacity ({}) must be >= minimum_samples ({})",
                self.window_capacity, self.minimum_samples
            )));
        }
        if self.open_duration_ms == 0 {
            return Err(HarnessError::Configuration(
                "open_duration_ms must be positive".to_string(),
            ));
        }
        if self.window_duration_ms == 0 {
            return Err(HarnessError::Configuration(
                "window_duration_ms must be positive".to_string(),
            ));
        }
        if self.half_open_trial_count == 0 {
            return Err(HarnessError::Configuration(
                "half_open_trial_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bulkhead tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadSettings {
    /// Maximum in-flight calls admitted to the backend
    pub max_concurrent: usize,
    /// How long an acquire waits for a free slot; 0 means fail fast
    pub queue_timeout_ms: u64,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_timeout_ms: 0,
        }
    }
}

impl BulkheadSettings {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(HarnessError::Configuration(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Degrading backend simulation knobs.
///
/// Deliberately unvalidated: the backend fails closed rather than rejecting
/// configuration. `leak_capacity = 0` means every call times out immediately;
/// `concurrency_cliff = 0` pins the effective error probability at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Latency with no leaked resources
    pub baseline_latency_ms: u64,
    /// Clamp for effective latency; also the reported duration of timeouts
    pub max_latency_ms: u64,
    /// Error probability with no concurrent load
    pub baseline_error_probability: f64,
    /// Resource units leaked per call, never returned until reset
    pub leak_increment: u64,
    /// Leaked units at which the simulated pool is exhausted
    pub leak_capacity: u64,
    /// In-flight call count at which error probability reaches certainty
    pub concurrency_cliff: u64,
    /// Whether effective latency is slept for or only reported
    pub latency_mode: LatencyMode,
    /// Seed for the failure-injection draw; `None` uses entropy
    pub rng_seed: Option<u64>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            baseline_latency_ms: 20,
            max_latency_ms: 2_000,
            baseline_error_probability: 0.05,
            leak_increment: 1,
            leak_capacity: 1_000,
            concurrency_cliff: 32,
            latency_mode: LatencyMode::Real,
            rng_seed: None,
        }
    }
}

impl BackendSettings {
    pub fn baseline_latency(&self) -> Duration {
        Duration::from_millis(self.baseline_latency_ms)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }
}

/// Out-of-band health probing tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Delay between scheduled probes
    pub probe_interval_ms: u64,
    /// Raw probe attempts per scheduled tick; a sample is recorded as failed
    /// only after this many consecutive raw failures
    pub retry_budget: u32,
    pub backoff: BackoffPolicy,
    /// Delay before the first retry attempt
    pub backoff_base_ms: u64,
    /// Cap on exponential backoff growth
    pub backoff_max_ms: u64,
    /// Age bound for health samples
    pub window_duration_ms: u64,
    /// Capacity bound for the sample window
    pub window_capacity: usize,
    /// Healthy flips to false once the sample failure ratio exceeds this
    pub unhealthy_ratio_threshold: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            retry_budget: 3,
            backoff: BackoffPolicy::Exponential,
            backoff_base_ms: 50,
            backoff_max_ms: 1_000,
            window_duration_ms: 60_000,
            window_capacity: 64,
            unhealthy_ratio_threshold: 0.5,
        }
    }
}

impl HealthSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.probe_interval_ms == 0 {
            return Err(HarnessError::Configuration(
                "probe_interval_ms must be positive".to_string(),
            ));
        }
        if self.retry_budget == 0 {
            return Err(HarnessError::Configuration(
                "retry_budget must be at least 1".to_string(),
            ));
        }
        if self.window_capacity == 0 {
            return Err(HarnessError::Configuration(
                "health window_capacity must be at least 1".to_string(),
            ));
        }
        if !(self.unhealthy_ratio_threshold > 0.0 && self.unhealthy_ratio_threshold <= 1.0) {
            return Err(HarnessError::Configuration(format!(
                "unhealthy_ratio_threshold must be in (0, 1], got {}",
                self.unhealthy_ratio_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_max_concurrent_is_fatal() {
        let mut config = HarnessConfig::default();
        config.bulkhead.max_concurrent = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn test_threshold_bounds_are_enforced() {
        let mut config = HarnessConfig::default();
        config.breaker.failure_ratio_threshold = 0.0;
        assert!(config.validate().is_err());

        config.breaker.failure_ratio_threshold = 1.5;
        assert!(config.validate().is_err());

        config.breaker.failure_ratio_threshold = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_knobs_are_never_rejected() {
        let mut config = HarnessConfig::default();
        config.backend.leak_capacity = 0;
        config.backend.concurrency_cliff = 0;
        config.backend.baseline_error_probability = 7.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_window_capacity_must_cover_minimum_samples() {
        let mut config = HarnessConfig::default();
        config.breaker.minimum_samples = 100;
        config.breaker.window_capacity = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r"component: payments_backend
breaker:
  failure_ratio_threshold: 0.25
  minimum_samples: 4
  window_capacity: 32
bulkhead:
  max_concurrent: 2
backend:
  baseline_latency_ms: 5
  latency_mode: simulated
  rng_seed: 42
"
        )
        .unwrap();

        let config = HarnessConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.component, "payments_backend");
        assert!((config.breaker.failure_ratio_threshold - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.breaker.minimum_samples, 4);
        assert_eq!(config.bulkhead.max_concurrent, 2);
        assert_eq!(config.backend.rng_seed, Some(42));
        assert_eq!(config.backend.latency_mode, LatencyMode::Simulated);
        // Untouched sections keep their defaults
        assert_eq!(config.health.retry_budget, 3);
    }

    #[test]
    fn test_duration_accessors() {
        let settings = BreakerSettings {
            open_duration_ms: 1_500,
            ..Default::default()
        };
        assert_eq!(settings.open_duration(), Duration::from_millis(1_500));
    }
}
