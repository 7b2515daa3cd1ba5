//! Event types for observing orchestration progress
//!
//! Events are sent from the engine to any number of observers (graph
//! visualization, notifications, metrics) on every status transition.
//! Emission is fire-and-forget: a failing sink is logged and skipped, never
//! allowed to stall the state machine.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::execution::Status;
use crate::interrupt::InterruptType;

/// Trait for sending orchestration events
///
/// This abstracts over the transport mechanism (channel, message bus, etc.)
/// allowing the engine to be used in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: OrchestrationEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted during plan execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OrchestrationEvent {
    /// A node execution changed status
    #[serde(rename_all = "camelCase")]
    NodeStatusChanged {
        plan_execution_id: String,
        node_execution_id: String,
        old_status: Status,
        new_status: Status,
        timestamp: DateTime<Utc>,
    },

    /// A plan execution changed status
    #[serde(rename_all = "camelCase")]
    PlanStatusChanged {
        plan_execution_id: String,
        old_status: Status,
        new_status: Status,
        timestamp: DateTime<Utc>,
    },

    /// An interrupt took effect on a node
    #[serde(rename_all = "camelCase")]
    InterruptApplied {
        plan_execution_id: String,
        node_execution_id: Option<String>,
        interrupt_id: String,
        interrupt_type: InterruptType,
        timestamp: DateTime<Utc>,
    },

    /// A barrier released or failed
    #[serde(rename_all = "camelCase")]
    BarrierResolved {
        plan_execution_id: String,
        barrier_ref: String,
        released: bool,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestrationEvent {
    pub fn node_status_changed(
        plan_execution_id: &str,
        node_execution_id: &str,
        old_status: Status,
        new_status: Status,
    ) -> Self {
        Self::NodeStatusChanged {
            plan_execution_id: plan_execution_id.to_string(),
            node_execution_id: node_execution_id.to_string(),
            old_status,
            new_status,
            timestamp: Utc::now(),
        }
    }

    pub fn plan_status_changed(plan_execution_id: &str, old_status: Status, new_status: Status) -> Self {
        Self::PlanStatusChanged {
            plan_execution_id: plan_execution_id.to_string(),
            old_status,
            new_status,
            timestamp: Utc::now(),
        }
    }

    pub fn plan_execution_id(&self) -> &str {
        match self {
            Self::NodeStatusChanged {
                plan_execution_id, ..
            }
            | Self::PlanStatusChanged {
                plan_execution_id, ..
            }
            | Self::InterruptApplied {
                plan_execution_id, ..
            }
            | Self::BarrierResolved {
                plan_execution_id, ..
            } => plan_execution_id,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: OrchestrationEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
#[derive(Default)]
pub struct VecEventSink {
    events: Mutex<Vec<OrchestrationEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.lock().clone()
    }

    /// Status changes recorded for one node execution, in order.
    pub fn node_transitions(&self, node_execution_id: &str) -> Vec<(Status, Status)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                OrchestrationEvent::NodeStatusChanged {
                    node_execution_id: id,
                    old_status,
                    new_status,
                    ..
                } if id == node_execution_id => Some((*old_status, *new_status)),
                _ => None,
            })
            .collect()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: OrchestrationEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events into an unbounded tokio channel.
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<OrchestrationEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::UnboundedSender<OrchestrationEvent>) -> Self {
        Self { sender }
    }

    /// Create a sink together with the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestrationEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: OrchestrationEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map_err(|_| EventError::channel_closed())
    }
}
