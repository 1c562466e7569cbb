//! Persistence seam for tree inventory, requests, quotas and cards
//!
//! ## Backends
//!
//! - [`SqliteTreeStore`] - rusqlite database file, used by the daemon
//! - [`MemoryTreeStore`] - in-process rows, used by tests and dry runs
//!
//! Every call is a single request/response. No transaction spans two calls,
//! so a read followed by a write can interleave with another caller's write.

pub mod memory;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{FulfillmentError, Result};
use crate::models::{
    current_timestamp, CardArtifact, EligibilityFilter, RecipientQuota, RequestStatus,
    ReservationRequest, TreeUnit,
};

pub use memory::MemoryTreeStore;
pub use sqlite::SqliteTreeStore;

// ============================================================================
// Query Types
// ============================================================================

/// Predicate over tree units, all set conditions must hold
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitFilter {
    pub ids: Option<Vec<i64>>,
    pub request_id: Option<i64>,
    /// Neither reserved nor assigned
    pub free_only: bool,
}

impl UnitFilter {
    pub fn for_request(request_id: i64) -> Self {
        Self {
            request_id: Some(request_id),
            ..Default::default()
        }
    }

    pub fn free_among(ids: &[i64]) -> Self {
        Self {
            ids: Some(ids.to_vec()),
            free_only: true,
            ..Default::default()
        }
    }

    pub fn in_request(request_id: i64, ids: &[i64]) -> Self {
        Self {
            ids: Some(ids.to_vec()),
            request_id: Some(request_id),
            free_only: false,
        }
    }

    pub fn matches(&self, unit: &TreeUnit) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.contains(&unit.id) {
                return false;
            }
        }
        if let Some(request_id) = self.request_id {
            if unit.reserved_by_request != Some(request_id) {
                return false;
            }
        }
        !self.free_only || unit.is_free()
    }
}

/// Rows targeted by an update
#[derive(Debug, Clone, PartialEq)]
pub enum UnitSelector {
    Ids(Vec<i64>),
    Request(i64),
}

impl UnitSelector {
    pub fn matches(&self, unit: &TreeUnit) -> bool {
        match self {
            UnitSelector::Ids(ids) => ids.contains(&unit.id),
            UnitSelector::Request(request_id) => unit.reserved_by_request == Some(*request_id),
        }
    }
}

/// Fields written when binding units to a recipient/assignee pair
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentFields {
    pub recipient: i64,
    pub assignee: i64,
    pub assigned_at: String,
    pub description: Option<String>,
    pub event_type: Option<String>,
    pub gifted_by: Option<i64>,
    pub gifted_by_name: Option<String>,
    pub user_tree_image: Option<String>,
}

/// Conditional update applied to every selected row
#[derive(Debug, Clone, PartialEq)]
pub enum UnitPatch {
    Reserve {
        request_id: i64,
        sponsor_user: i64,
        sponsor_group: Option<i64>,
    },
    ClearReservation,
    Assign(AssignmentFields),
    ClearAssignment,
}

impl UnitPatch {
    /// Apply the patch to an in-memory row
    pub fn apply(&self, unit: &mut TreeUnit) {
        let now = current_timestamp();
        match self {
            UnitPatch::Reserve {
                request_id,
                sponsor_user,
                sponsor_group,
            } => {
                unit.reserved_by_request = Some(*request_id);
                unit.sponsor_user = Some(*sponsor_user);
                unit.sponsor_group = *sponsor_group;
                unit.mapped_at = Some(now.clone());
            }
            UnitPatch::ClearReservation => {
                unit.reserved_by_request = None;
                unit.sponsor_user = None;
                unit.sponsor_group = None;
                unit.mapped_at = None;
            }
            UnitPatch::Assign(fields) => {
                unit.assigned_recipient = Some(fields.recipient);
                unit.assigned_assignee = Some(fields.assignee);
                unit.assigned_at = Some(fields.assigned_at.clone());
                unit.description = fields.description.clone();
                unit.event_type = fields.event_type.clone();
                unit.gifted_by = fields.gifted_by;
                unit.gifted_by_name = fields.gifted_by_name.clone();
                unit.user_tree_image = fields.user_tree_image.clone();
            }
            UnitPatch::ClearAssignment => {
                unit.assigned_recipient = None;
                unit.assigned_assignee = None;
                unit.assigned_at = None;
                unit.description = None;
                unit.event_type = None;
                unit.gifted_by = None;
                unit.gifted_by_name = None;
                unit.user_tree_image = None;
            }
        }
        unit.updated_at = now;
    }
}

/// A reservation write together with the checks that guard it
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationClaim {
    pub request_id: i64,
    pub pledged_count: usize,
    pub unit_ids: Vec<i64>,
    pub sponsor_user: i64,
    pub sponsor_group: Option<i64>,
    /// Reject unless every id is currently free
    pub require_free: bool,
}

// ============================================================================
// Store Trait
// ============================================================================

#[async_trait]
pub trait TreeStore: Send + Sync {
    // Inventory

    /// Free units of a plot accepted by `filter`, in id order.
    ///
    /// Returns at most `limit` units, or at most `limit` per plant type when
    /// `filter.diversify` is set.
    async fn fetch_free_units(&self, plot_id: i64, limit: usize, filter: EligibilityFilter) -> Result<Vec<TreeUnit>>;

    async fn count_units(&self, filter: &UnitFilter) -> Result<usize>;

    /// Apply `patch` to exactly the selected rows, returning rows affected
    async fn update_units(&self, selector: &UnitSelector, patch: &UnitPatch) -> Result<usize>;

    /// Units reserved by a request, in id order
    async fn list_request_units(&self, request_id: i64) -> Result<Vec<TreeUnit>>;

    async fn insert_units(&self, units: &[TreeUnit]) -> Result<()>;

    // Requests

    async fn get_request(&self, request_id: i64) -> Result<Option<ReservationRequest>>;

    async fn insert_request(&self, request: &ReservationRequest) -> Result<()>;

    async fn update_request_status(&self, request_id: i64, status: RequestStatus) -> Result<()>;

    // Quotas

    /// Quotas of a request in id order
    async fn read_quotas(&self, request_id: i64) -> Result<Vec<RecipientQuota>>;

    /// Insert or replace a quota row
    async fn upsert_quota(&self, quota: &RecipientQuota) -> Result<()>;

    async fn delete_quotas(&self, request_id: i64, quota_ids: &[i64]) -> Result<usize>;

    async fn update_quota_mail(&self, quota_id: i64, mail_sent: bool, mail_error: Option<String>) -> Result<()>;

    // Card templates and artifacts

    /// Plant type to template slot id
    async fn template_slots(&self) -> Result<HashMap<String, String>>;

    async fn set_template_slot(&self, plant_type: &str, slot_id: &str) -> Result<()>;

    /// Cards of a request in id order
    async fn list_cards(&self, request_id: i64) -> Result<Vec<CardArtifact>>;

    async fn insert_card(&self, request_id: i64, unit_id: i64, quota_id: Option<i64>) -> Result<CardArtifact>;

    async fn update_card(&self, card: &CardArtifact) -> Result<()>;

    /// Guarded reservation write.
    ///
    /// The provided implementation reads, checks and writes in separate calls,
    /// so two callers can both pass the checks before either writes. A backend
    /// with an atomic predicate update can override this without any change to
    /// callers.
    async fn reserve_checked(&self, claim: &ReservationClaim) -> Result<usize> {
        if claim.unit_ids.is_empty() {
            return Ok(0);
        }

        if claim.require_free {
            let free = self.count_units(&UnitFilter::free_among(&claim.unit_ids)).await?;
            if free != claim.unit_ids.len() {
                return Err(FulfillmentError::Validation(
                    "Some tree ids are already reserved/assigned to someone else or are invalid".into(),
                ));
            }
        }

        let already_reserved = self.count_units(&UnitFilter::for_request(claim.request_id)).await?;
        if already_reserved + claim.unit_ids.len() > claim.pledged_count {
            return Err(FulfillmentError::Overbooking {
                requested: claim.unit_ids.len(),
                already_reserved,
                pledged: claim.pledged_count,
            });
        }

        debug!(
            request_id = claim.request_id,
            units = claim.unit_ids.len(),
            already_reserved = already_reserved,
            "Reservation checks passed, writing"
        );

        self.update_units(
            &UnitSelector::Ids(claim.unit_ids.clone()),
            &UnitPatch::Reserve {
                request_id: claim.request_id,
                sponsor_user: claim.sponsor_user,
                sponsor_group: claim.sponsor_group,
            },
        )
        .await
    }
}
