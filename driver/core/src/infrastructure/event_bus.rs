// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory event streaming over tokio broadcast channels. The lifecycle
// services publish here; the binary logs the stream and tests assert on it.
// Events are not persisted.

use crate::domain::events::{OperatorEvent, SnapshotEvent, VolumeEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Volume(VolumeEvent),
    Snapshot(SnapshotEvent),
    Operator(OperatorEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_volume_event(&self, event: VolumeEvent) {
        self.publish(DomainEvent::Volume(event));
    }

    pub fn publish_snapshot_event(&self, event: SnapshotEvent) {
        self.publish(DomainEvent::Snapshot(event));
    }

    pub fn publish_operator_event(&self, event: OperatorEvent) {
        self.publish(DomainEvent::Operator(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_snapshot_event(SnapshotEvent::SnapshotDeleted {
            snapshot_id: "17;UUID;pvc-1;snap-1;path=/ibm/fs1/pvc-1".to_string(),
            deleted_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Snapshot(SnapshotEvent::SnapshotDeleted { snapshot_id, .. }) => {
                assert!(snapshot_id.contains("snap-1"));
            }
            _ => panic!("Wrong event type received"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_operator_event(OperatorEvent::ReconcileFailed {
            owner: "default/scale".to_string(),
            reason: "secret missing".to_string(),
            failed_at: Utc::now(),
        });

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }
}
