#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Resiliency Harness
//!
//! A test harness for exercising fault-tolerance policy against a simulated
//! degrading dependency. The harness composes four independently testable
//! components behind a single call boundary:
//!
//! - [`DegradingBackend`] - a backing-service simulator whose latency and
//!   error rate worsen with elapsed use and concurrent load, and which leaks
//!   a bounded resource pool until it is exhausted and fails closed
//! - [`Bulkhead`] - a counting concurrency limiter that rejects overflow
//!   instead of queueing indefinitely
//! - [`CircuitBreaker`] - a Closed/Open/HalfOpen admission guard driven by a
//!   rolling window of call outcomes
//! - [`HealthAggregator`] - an out-of-band prober with a per-probe retry
//!   budget and a smoothed healthy signal
//!
//! ## Architecture
//!
//! Every call through [`ResiliencyHarness::call`] runs bulkhead admission,
//! then breaker admission, then backend execution, with the outcome fed back
//! into the breaker; the bulkhead slot is released on every exit path. The
//! health monitor runs on an independent timer and probes the backend
//! directly - health checks must observe raw backend state, not the
//! breaker's view of it.
//!
//! Shared state is limited to atomic counters and short exclusive sections
//! that are never held across backend execution. Breaker transitions are
//! linearizable and published as [`StateChangeEvent`]s on a broadcast
//! channel.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resiliency_harness::{BackendRequest, HarnessConfig, ResiliencyHarness};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let harness = ResiliencyHarness::new(HarnessConfig::default())?;
//! harness.start_health_monitor();
//!
//! let mut transitions = harness.subscribe_state_changes();
//! tokio::spawn(async move {
//!     while let Ok(event) = transitions.recv().await {
//!         println!("breaker {} -> {}", event.from, event.to);
//!     }
//! });
//!
//! match harness.call(BackendRequest::new("ping")).await {
//!     Ok(response) => println!("ok in {:?}", response.latency),
//!     Err(error) => println!("rejected or failed: {error}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`harness`] - the composed facade and its call path
//! - [`breaker`] - circuit breaker state machine and outcome window
//! - [`bulkhead`] - concurrency limiter and scoped permits
//! - [`backend`] - degrading backend simulation
//! - [`health`] - out-of-band health probing
//! - [`config`] - construction-time configuration and validation
//! - [`events`] - state-change event stream
//! - [`metrics`] - point-in-time metric snapshots
//! - [`error`] - structured error taxonomy

pub mod backend;
pub mod breaker;
pub mod bulkhead;
pub mod config;
pub mod error;
pub mod events;
pub mod harness;
pub mod health;
pub mod logging;
pub mod metrics;

pub use backend::{
    BackendRequest, BackendResponse, BackingService, DegradationProfile, DegradingBackend,
    LatencyMode,
};
pub use breaker::{BreakerState, CallOutcome, CallPermit, CircuitBreaker, HalfOpenPolicy};
pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use config::{
    BackendSettings, BreakerSettings, BulkheadSettings, HarnessConfig, HealthSettings,
};
pub use error::{HarnessError, Result};
pub use events::{EventPublisher, StateChangeEvent};
pub use harness::ResiliencyHarness;
pub use health::{BackoffPolicy, HealthAggregator, HealthSample, HealthSnapshot};
pub use metrics::{BreakerMetrics, HarnessMetrics};
