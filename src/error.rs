//! # Structured Error Handling
//!
//! Error taxonomy for the resiliency harness. Admission rejections
//! (`BulkheadFull`, `BreakerOpen`) are returned before any backend call is
//! made and never feed back into the circuit breaker's outcome window.
//! Backend faults (`BackendTimeout`, `BackendError`) are ordinary outcomes
//! that count toward the breaker's failure ratio.

use std::time::Duration;

/// Errors surfaced by the harness and its components
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// All concurrency slots are occupied and the queue timeout elapsed
    #[error("Bulkhead is full for {component}")]
    BulkheadFull { component: String },

    /// Circuit is open (or half-open with no trial budget left), rejecting calls
    #[error("Circuit breaker is open for {component}")]
    BreakerOpen { component: String },

    /// The backing service exceeded its latency bound (or is exhausted)
    #[error("Backing service timed out after {latency:?}")]
    BackendTimeout { latency: Duration },

    /// The backing service returned an application-level failure
    #[error("Backing service failed after {latency:?}: {message}")]
    BackendError { message: String, latency: Duration },

    /// A bulkhead permit was released more than once - a programming defect
    #[error("Bulkhead permit for {component} released more than once")]
    DoubleRelease { component: String },

    /// Invalid configuration detected at construction time
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl HarnessError {
    /// Rejections happen before the backend is invoked and must not be
    /// recorded as breaker failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            HarnessError::BulkheadFull { .. } | HarnessError::BreakerOpen { .. }
        )
    }

    /// Backend faults are the only errors that count toward the failure ratio.
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            HarnessError::BackendTimeout { .. } | HarnessError::BackendError { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
