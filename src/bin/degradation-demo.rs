//! Scenario driver: hammers a degrading backend through the harness until
//! the circuit opens, then watches it recover.
//!
//! Run with `cargo run --bin degradation-demo`.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use resiliency_harness::{
    BackendRequest, BackendSettings, BreakerSettings, BulkheadSettings, HarnessConfig,
    HealthSettings, LatencyMode, ResiliencyHarness,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    resiliency_harness::logging::init_structured_logging();

    let config = HarnessConfig {
        component: "demo_backend".to_string(),
        breaker: BreakerSettings {
            failure_ratio_threshold: 0.5,
            minimum_samples: 8,
            open_duration_ms: 500,
            half_open_trial_count: 2,
            window_capacity: 64,
            ..Default::default()
        },
        bulkhead: BulkheadSettings {
            max_concurrent: 8,
            queue_timeout_ms: 0,
        },
        backend: BackendSettings {
            baseline_latency_ms: 10,
            max_latency_ms: 200,
            baseline_error_probability: 0.05,
            leak_capacity: 200,
            concurrency_cliff: 12,
            latency_mode: LatencyMode::Real,
            rng_seed: Some(2023),
            ..Default::default()
        },
        health: HealthSettings {
            probe_interval_ms: 250,
            retry_budget: 2,
            ..Default::default()
        },
    };

    let harness = Arc::new(ResiliencyHarness::new(config)?);
    harness.start_health_monitor();

    // Print every breaker transition as it happens
    let mut transitions = harness.subscribe_state_changes();
    tokio::spawn(async move {
        while let Ok(event) = transitions.recv().await {
            info!(
                component = %event.component,
                from = %event.from,
                to = %event.to,
                at = %event.occurred_at,
                "⚡ Breaker transition"
            );
        }
    });

    // Sixteen workers against eight bulkhead slots: enough contention to
    // climb the concurrency cliff and trip the breaker.
    let mut workers = Vec::new();
    for worker in 0..16 {
        let harness = Arc::clone(&harness);
        workers.push(tokio::spawn(async move {
            for call in 0..40 {
                let request = BackendRequest::new(format!("worker-{worker}-call-{call}"));
                let _ = harness.call(request).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }));
    }
    for worker in workers {
        worker.await?;
    }

    let profile = harness.degradation_profile();
    let metrics = harness.metrics();
    let breaker = harness.breaker_metrics();
    let health = harness.health_snapshot();

    info!(
        calls_served = profile.calls_served,
        leaked_units = profile.leaked_units,
        effective_latency_ms = profile.effective_latency.as_millis(),
        effective_error_probability = profile.effective_error_probability,
        "📉 Final degradation profile"
    );
    info!(
        calls_total = metrics.calls_total,
        successes = metrics.successes,
        backend_errors = metrics.backend_errors,
        backend_timeouts = metrics.backend_timeouts,
        bulkhead_rejections = metrics.bulkhead_rejections,
        breaker_rejections = metrics.breaker_rejections,
        "📊 Harness metrics"
    );
    info!(
        state = %breaker.current_state,
        failure_rate = breaker.failure_rate,
        rejected_open = breaker.rejected_open,
        "🛡️ Breaker metrics"
    );
    info!(
        healthy = health.healthy,
        failure_ratio = health.failure_ratio,
        sample_count = health.sample_count,
        "🩺 Health snapshot"
    );

    harness.shutdown();
    Ok(())
}
