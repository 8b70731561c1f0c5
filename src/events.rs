//! Broadcast channel for circuit breaker state transitions.
//!
//! Subscribers receive only transitions that occur after they subscribe; the
//! stream is infinite and not restartable. Publishing with no subscribers is
//! not an error - the breaker emits transitions unconditionally and external
//! collectors attach when they care.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::breaker::BreakerState;

/// A single breaker state transition
#[derive(Debug, Clone, Serialize)]
pub struct StateChangeEvent {
    /// Name of the protected component
    pub component: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub occurred_at: DateTime<Utc>,
}

impl StateChangeEvent {
    pub fn new(component: impl Into<String>, from: BreakerState, to: BreakerState) -> Self {
        Self {
            component: component.into(),
            from,
            to,
            occurred_at: Utc::now(),
        }
    }
}

/// Fan-out publisher for state-change events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<StateChangeEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a transition to all current subscribers.
    ///
    /// A broadcast send fails only when no subscriber exists, which is
    /// acceptable here - transitions are emitted whether or not anyone is
    /// listening.
    pub fn publish(&self, event: StateChangeEvent) {
        if let Err(broadcast::error::SendError(dropped)) = self.sender.send(event) {
            tracing::trace!(
                component = %dropped.component,
                from = %dropped.from,
                to = %dropped.to,
                "State change emitted with no subscribers"
            );
        }
    }

    /// Subscribe to transitions from this point onward
    pub fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}
