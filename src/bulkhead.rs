//! # Bulkhead
//!
//! Counting concurrency limiter isolating the backing service's blast
//! radius. Admission hands out a [`BulkheadPermit`] whose slot is returned
//! exactly once: explicitly through [`BulkheadPermit::release`], or by drop
//! when the protected call unwinds early or is cancelled. A second explicit
//! release is a programming defect and is reported, not swallowed.
//!
//! With `queue_timeout = 0` admission is non-blocking: a full bulkhead at
//! call time is an immediate `BulkheadFull`. A positive timeout queues the
//! caller for up to that long. Cancelling a queued acquire never consumes a
//! slot.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use crate::config::BulkheadSettings;
use crate::error::{HarnessError, Result};

/// Concurrency limiter for one protected dependency
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    queue_timeout: Duration,
}

impl Bulkhead {
    /// Create a bulkhead with `max_concurrent` slots.
    ///
    /// Settings are validated by [`HarnessConfig::validate`] before
    /// construction (`max_concurrent` must be positive).
    ///
    /// [`HarnessConfig::validate`]: crate::config::HarnessConfig::validate
    pub fn new(name: impl Into<String>, settings: &BulkheadSettings) -> Self {
        let name = name.into();
        info!(
            component = %name,
            max_concurrent = settings.max_concurrent,
            queue_timeout_ms = settings.queue_timeout_ms,
            "🧱 Bulkhead initialized"
        );
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent)),
            max_concurrent: settings.max_concurrent,
            queue_timeout: settings.queue_timeout(),
        }
    }

    /// Acquire a concurrency slot, waiting up to the configured queue
    /// timeout. Fails with `BulkheadFull` when no slot frees up in time.
    pub async fn acquire(&self) -> Result<BulkheadPermit> {
        let permit = if self.queue_timeout.is_zero() {
            self.semaphore.clone().try_acquire_owned().ok()
        } else {
            match tokio::time::timeout(
                self.queue_timeout,
                self.semaphore.clone().acquire_owned(),
            )
            .await
            {
                Ok(acquired) => acquired.ok(),
                Err(_elapsed) => None,
            }
        };

        match permit {
            Some(inner) => Ok(BulkheadPermit {
                component: self.name.clone(),
                inner: Some(inner),
            }),
            None => {
                debug!(
                    component = %self.name,
                    max_concurrent = self.max_concurrent,
                    "🧱 Bulkhead full, rejecting call"
                );
                Err(HarnessError::BulkheadFull {
                    component: self.name.clone(),
                })
            }
        }
    }

    /// Slots currently free
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Calls currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One occupied concurrency slot.
///
/// The slot is returned on drop, so holding the permit across the protected
/// call guarantees release on success, failure, and cancellation alike.
#[derive(Debug)]
pub struct BulkheadPermit {
    component: String,
    inner: Option<OwnedSemaphorePermit>,
}

impl BulkheadPermit {
    /// Explicitly return the slot.
    ///
    /// Calling this twice reports a `DoubleRelease` defect; the slot itself
    /// is only ever returned once.
    pub fn release(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(permit) => {
                drop(permit);
                Ok(())
            }
            None => {
                error!(
                    component = %self.component,
                    "💥 Bulkhead permit released more than once"
                );
                Err(HarnessError::DoubleRelease {
                    component: self.component.clone(),
                })
            }
        }
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        // Slot returns automatically unless release() already ran
        self.inner.take();
    }
}
