//! Grove Fulfillment - tree reservation, assignment and card rendering
//!
//! Turns a pledged donation or gift into reserved trees, assigns them to
//! recipients and renders one personalized card per tree.
//!
//! ## Pipeline
//!
//! ```text
//! request ──reserve──▶ InventoryAllocator   (plots → reserved units)
//!         ──assign───▶ AssignmentEngine     (reserved units → recipient quotas)
//!         ──render───▶ ArtifactBatchPipeline (assigned units → card images)
//!         ──notify───▶ NotificationService  (card images → recipient mails)
//! ```
//!
//! [`RequestLifecycle`] drives a request through the stages and advances its
//! status once each stage's result has been read back from the store.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/grove-fulfillment/
//! ├── fulfillment.db         # SQLite inventory, requests, quotas, cards
//! ├── cards/                 # Rendered card images, served publicly
//! │   └── {request_key}/{sapling}.png
//! └── config.toml            # Configuration
//! ```

pub mod cards;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod object_store;
pub mod rasterize;
pub mod retry;
pub mod services;
pub mod slides;

// Re-exports
pub use cards::{ArtifactBatchPipeline, GenerationReport, PipelineOptions};
pub use concurrency::run_with_concurrency;
pub use config::Config;
pub use db::{MemoryTreeStore, SqliteTreeStore, TreeStore};
pub use error::{FulfillmentError, Result};
pub use models::{
    CardArtifact, EligibilityFilter, PlotDemand, RecipientQuota, RequestKind, RequestStatus,
    ReservationRequest, ReservationStats, TreeUnit,
};
pub use notify::{LoggingNotifier, NotificationOptions, NotificationService, Notifier};
pub use object_store::{FsObjectStore, ObjectStore};
pub use rasterize::{CommandRasterizer, Rasterizer};
pub use retry::{with_retry, RetryPolicy};
pub use services::{
    AssignmentEngine, AssignmentPair, Collaborators, EventBus, FulfillmentEvent, InventoryAllocator,
    PlotReservation, RequestLifecycle, Services, UnitScope,
};
pub use slides::{HttpSlideService, SlideService, SlotRecord};
