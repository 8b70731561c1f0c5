//! Point-in-time metric snapshots for the breaker and the harness facade.
//!
//! Components keep raw counters behind their own locks or atomics; these
//! types are the cloned, derived views handed to callers. Rates and averages
//! are computed at snapshot time so the hot path never does float math.

use serde::Serialize;
use std::time::Duration;

use crate::breaker::BreakerState;

/// Snapshot of circuit breaker activity
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    /// Calls rejected while open or while half-open trial budget was spent
    pub rejected_open: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
    /// Failures plus timeouts over total recorded calls
    pub failure_rate: f64,
    pub success_rate: f64,
    pub current_state: BreakerState,
    /// Samples currently inside the rolling outcome window
    pub window_samples: usize,
    /// Failure ratio over the rolling window, `None` until a sample exists
    pub window_failure_ratio: Option<f64>,
}

impl BreakerMetrics {
    /// Derive rates from raw counters.
    pub(crate) fn finalize(mut self) -> Self {
        if self.total_calls > 0 {
            let failures = self.failure_count + self.timeout_count;
            self.failure_rate = failures as f64 / self.total_calls as f64;
            self.success_rate = self.success_count as f64 / self.total_calls as f64;
            self.average_duration = self.total_duration / self.total_calls as u32;
        }
        self
    }
}

impl Default for BreakerMetrics {
    fn default() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            timeout_count: 0,
            rejected_open: 0,
            total_duration: Duration::ZERO,
            average_duration: Duration::ZERO,
            failure_rate: 0.0,
            success_rate: 0.0,
            current_state: BreakerState::Closed,
            window_samples: 0,
            window_failure_ratio: None,
        }
    }
}

/// Snapshot of harness-level call accounting
#[derive(Debug, Clone, Default, Serialize)]
pub struct HarnessMetrics {
    /// Calls that entered `ResiliencyHarness::call`
    pub calls_total: u64,
    pub successes: u64,
    pub backend_errors: u64,
    pub backend_timeouts: u64,
    /// Rejected at bulkhead admission, before the breaker was consulted
    pub bulkhead_rejections: u64,
    /// Rejected at breaker admission, after a bulkhead slot was held
    pub breaker_rejections: u64,
}

impl HarnessMetrics {
    /// Calls that actually reached the backing service
    pub fn backend_calls(&self) -> u64 {
        self.successes + self.backend_errors + self.backend_timeouts
    }
}
