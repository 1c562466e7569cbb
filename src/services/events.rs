//! Event system for fulfillment operations
//!
//! Services emit an event after every successful write so listeners can keep
//! audit trails or trigger follow-up work without polling the store.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::models::RequestStatus;

/// Events emitted by the services
#[derive(Debug, Clone, PartialEq)]
pub enum FulfillmentEvent {
    TreesReserved {
        request_id: i64,
        unit_ids: Vec<i64>,
    },
    TreesUnreserved {
        request_id: i64,
        count: usize,
    },
    TreesAssigned {
        request_id: i64,
        quota_id: i64,
        unit_ids: Vec<i64>,
    },
    TreesUnassigned {
        request_id: i64,
        count: usize,
    },
    CardRendered {
        request_id: i64,
        unit_id: i64,
        image_url: String,
    },
    CardRenderFailed {
        request_id: i64,
        unit_id: i64,
        error: String,
    },
    StatusChanged {
        request_id: i64,
        from: RequestStatus,
        to: RequestStatus,
    },
    NotificationSent {
        request_id: i64,
        quota_id: i64,
        error: Option<String>,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &FulfillmentEvent);
}

/// Event bus for broadcasting fulfillment events
pub struct EventBus {
    sender: broadcast::Sender<FulfillmentEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: FulfillmentEvent) {
        trace!(event = ?event, "Emitting fulfillment event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FulfillmentEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &FulfillmentEvent) {
        match event {
            FulfillmentEvent::TreesReserved { request_id, unit_ids } => {
                info!(request_id = request_id, count = unit_ids.len(), "Trees reserved");
            }
            FulfillmentEvent::TreesAssigned {
                request_id,
                quota_id,
                unit_ids,
            } => {
                debug!(request_id = request_id, quota_id = quota_id, count = unit_ids.len(), "Trees assigned");
            }
            FulfillmentEvent::CardRenderFailed {
                request_id,
                unit_id,
                error,
            } => {
                info!(request_id = request_id, unit_id = unit_id, error = %error, "Card render failed");
            }
            FulfillmentEvent::StatusChanged { request_id, from, to } => {
                info!(request_id = request_id, from = %from, to = %to, "Request status changed");
            }
            _ => {
                trace!(event = ?event, "Fulfillment event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
