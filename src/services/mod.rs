//! Service layer for grove-fulfillment
//!
//! Services hold the reservation, assignment and lifecycle rules on top of
//! the [`TreeStore`] seam. Each service:
//! - Validates input before any write
//! - Emits an event after each successful write
//! - Receives its collaborators at construction
//!
//! ## Architecture
//!
//! ```text
//! CLI (thin)
//!     ↓
//! Service Layer (allocation, assignment, cards, lifecycle)
//!     ↓
//! TreeStore (db/*.rs)   SlideService / ObjectStore / Rasterizer / Notifier
//! ```

pub mod allocator;
pub mod assignment;
pub mod events;
pub mod lifecycle;

// Re-exports
pub use allocator::{distribute_by_plant_type, merge_demands, InventoryAllocator, PlotReservation};
pub use assignment::{AssignmentEngine, AssignmentPair, QuotaFill};
pub use events::{EventBus, EventListener, FulfillmentEvent};
pub use lifecycle::RequestLifecycle;

use std::sync::Arc;

use crate::cards::pipeline::ArtifactBatchPipeline;
use crate::config::Config;
use crate::db::TreeStore;
use crate::notify::{NotificationService, Notifier};
use crate::object_store::ObjectStore;
use crate::rasterize::Rasterizer;
use crate::slides::SlideService;

/// Units an unreserve or unassign call applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitScope {
    Ids(Vec<i64>),
    /// Every unit reserved by the request
    All,
}

/// External services the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub slides: Arc<dyn SlideService>,
    pub objects: Arc<dyn ObjectStore>,
    pub rasterizer: Arc<dyn Rasterizer>,
    pub notifier: Arc<dyn Notifier>,
}

/// Service container for dependency injection
///
/// Holds all services with a shared store and event bus.
pub struct Services {
    pub allocator: Arc<InventoryAllocator>,
    pub assignment: Arc<AssignmentEngine>,
    pub pipeline: Arc<ArtifactBatchPipeline>,
    pub lifecycle: Arc<RequestLifecycle>,
    pub notifications: Arc<NotificationService>,
    pub events: Arc<EventBus>,
    pub store: Arc<dyn TreeStore>,
}

impl Services {
    /// Create all services with a shared store
    pub fn new(store: Arc<dyn TreeStore>, collaborators: Collaborators, config: &Config) -> Self {
        let events = Arc::new(EventBus::new());

        let allocator = Arc::new(InventoryAllocator::new(store.clone(), events.clone()));
        let assignment = Arc::new(AssignmentEngine::new(
            store.clone(),
            events.clone(),
            config.persistence_writes,
        ));
        let pipeline = Arc::new(ArtifactBatchPipeline::new(
            store.clone(),
            collaborators.slides,
            collaborators.objects,
            collaborators.rasterizer,
            events.clone(),
            config.pipeline_options(),
        ));
        let lifecycle = Arc::new(RequestLifecycle::new(
            store.clone(),
            events.clone(),
            allocator.clone(),
            assignment.clone(),
            pipeline.clone(),
        ));
        let notifications = Arc::new(NotificationService::new(
            store.clone(),
            collaborators.notifier,
            events.clone(),
            config.notification_sends,
            config.retry_policy(),
        ));

        Self {
            allocator,
            assignment,
            pipeline,
            lifecycle,
            notifications,
            events,
            store,
        }
    }
}
