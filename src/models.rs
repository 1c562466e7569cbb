//! Domain rows for inventory, requests, quotas and card artifacts
//!
//! Timestamps are stored as RFC 3339 strings, the same representation the
//! SQLite store persists.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FulfillmentError;

/// Get current timestamp as an RFC 3339 string
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ============================================================================
// Inventory
// ============================================================================

/// Habit of a unit that is bookable without `include_all_habits`
pub const TREE_HABIT: &str = "Tree";

/// One physical tree that can be reserved and/or assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeUnit {
    pub id: i64,
    /// Human facing label, used for storage keys and card text
    pub sapling_id: String,
    pub plot_id: i64,
    pub plant_type: String,
    pub habit: String,
    pub giftable: bool,

    // Reservation
    pub reserved_by_request: Option<i64>,
    pub sponsor_user: Option<i64>,
    pub sponsor_group: Option<i64>,
    pub mapped_at: Option<String>,

    // Assignment
    pub assigned_recipient: Option<i64>,
    pub assigned_assignee: Option<i64>,
    pub assigned_at: Option<String>,
    pub description: Option<String>,
    pub event_type: Option<String>,
    pub gifted_by: Option<i64>,
    pub gifted_by_name: Option<String>,
    pub user_tree_image: Option<String>,

    pub updated_at: String,
}

impl TreeUnit {
    /// Create an unreserved, unassigned unit
    pub fn new(id: i64, plot_id: i64, plant_type: impl Into<String>) -> Self {
        Self {
            id,
            sapling_id: id.to_string(),
            plot_id,
            plant_type: plant_type.into(),
            habit: TREE_HABIT.to_string(),
            giftable: true,
            reserved_by_request: None,
            sponsor_user: None,
            sponsor_group: None,
            mapped_at: None,
            assigned_recipient: None,
            assigned_assignee: None,
            assigned_at: None,
            description: None,
            event_type: None,
            gifted_by: None,
            gifted_by_name: None,
            user_tree_image: None,
            updated_at: current_timestamp(),
        }
    }

    /// Free means neither reserved nor assigned to anyone
    pub fn is_free(&self) -> bool {
        self.reserved_by_request.is_none()
            && self.sponsor_user.is_none()
            && self.sponsor_group.is_none()
            && self.assigned_recipient.is_none()
            && self.assigned_assignee.is_none()
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned_assignee.is_some()
    }
}

/// Eligibility filters applied when fetching free units of a plot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EligibilityFilter {
    /// Also consider units not flagged giftable
    pub include_non_giftable: bool,
    /// Also consider non-tree habits (shrubs, climbers, ...)
    pub include_all_habits: bool,
    /// Fetch up to the demand per plant type instead of in id order
    pub diversify: bool,
}

impl EligibilityFilter {
    pub fn accepts(&self, unit: &TreeUnit) -> bool {
        unit.is_free()
            && (self.include_non_giftable || unit.giftable)
            && (self.include_all_habits || unit.habit == TREE_HABIT)
    }
}

/// Desired count of units from one plot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotDemand {
    pub plot_id: i64,
    pub desired_count: usize,
}

impl PlotDemand {
    pub fn new(plot_id: i64, desired_count: usize) -> Self {
        Self { plot_id, desired_count }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Request status chain: pending_plot_selection -> reserved -> pending_artifacts -> completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    PendingPlotSelection,
    Reserved,
    PendingArtifacts,
    Completed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::PendingPlotSelection => "pending_plot_selection",
            RequestStatus::Reserved => "reserved",
            RequestStatus::PendingArtifacts => "pending_artifacts",
            RequestStatus::Completed => "completed",
        }
    }

    /// The only status this one may advance to
    pub fn next(&self) -> Option<RequestStatus> {
        match self {
            RequestStatus::PendingPlotSelection => Some(RequestStatus::Reserved),
            RequestStatus::Reserved => Some(RequestStatus::PendingArtifacts),
            RequestStatus::PendingArtifacts => Some(RequestStatus::Completed),
            RequestStatus::Completed => None,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = FulfillmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_plot_selection" => Ok(RequestStatus::PendingPlotSelection),
            "reserved" => Ok(RequestStatus::Reserved),
            "pending_artifacts" => Ok(RequestStatus::PendingArtifacts),
            "completed" => Ok(RequestStatus::Completed),
            other => Err(FulfillmentError::Validation(format!("Unknown request status: {}", other))),
        }
    }
}

/// Kind of request, decides which fields an assignment writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Donation,
    Gift,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Donation => "donation",
            RequestKind::Gift => "gift",
        }
    }
}

impl FromStr for RequestKind {
    type Err = FulfillmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "donation" => Ok(RequestKind::Donation),
            "gift" => Ok(RequestKind::Gift),
            other => Err(FulfillmentError::Validation(format!("Unknown request kind: {}", other))),
        }
    }
}

/// Event types with dedicated message wording
pub mod event_types {
    pub const BIRTHDAY: &str = "1";
    pub const MEMORIAL: &str = "2";
}

/// A donation or gift request with a pledged tree count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub id: i64,
    /// Opaque key used to namespace rendered images
    pub request_key: String,
    pub kind: RequestKind,
    pub sponsor_user: i64,
    pub sponsor_group: Option<i64>,
    /// Display name of the sponsor, used to name card containers
    pub sponsor_name: String,
    pub pledged_count: usize,
    pub diversify: bool,
    pub include_all_habits: bool,
    pub include_non_giftable: bool,
    pub plots: Vec<PlotDemand>,
    pub status: RequestStatus,

    // Card content
    pub event_type: Option<String>,
    pub event_name: Option<String>,
    pub gifted_on: Option<String>,
    pub gifted_by_name: Option<String>,
    pub primary_message: String,
    pub secondary_message: String,
    pub logo_url: Option<String>,
    pub logo_message: String,

    pub created_at: String,
    pub updated_at: String,
}

impl ReservationRequest {
    /// Create a request with the default card messages
    pub fn new(id: i64, kind: RequestKind, sponsor_user: i64, pledged_count: usize) -> Self {
        let now = current_timestamp();
        Self {
            id,
            request_key: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            sponsor_user,
            sponsor_group: None,
            sponsor_name: String::new(),
            pledged_count,
            diversify: false,
            include_all_habits: false,
            include_non_giftable: false,
            plots: Vec::new(),
            status: RequestStatus::PendingPlotSelection,
            event_type: None,
            event_name: None,
            gifted_on: None,
            gifted_by_name: None,
            primary_message: crate::cards::message::DEFAULT_PRIMARY.to_string(),
            secondary_message: crate::cards::message::DEFAULT_SECONDARY.to_string(),
            logo_url: None,
            logo_message: crate::cards::message::DEFAULT_LOGO.to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn filter(&self) -> EligibilityFilter {
        EligibilityFilter {
            include_non_giftable: self.include_non_giftable,
            include_all_habits: self.include_all_habits,
            diversify: self.diversify,
        }
    }

    /// Name given to the n-th (0-based) duplicated card container
    pub fn container_name(&self, batch: usize) -> String {
        format!("{}-[{}] ({})", self.sponsor_name, self.id, batch + 1)
    }
}

/// Reservation progress of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationStats {
    pub total_requested: usize,
    pub already_reserved: usize,
    pub remaining: usize,
}

// ============================================================================
// Quotas
// ============================================================================

/// A recipient's requested tree count within a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientQuota {
    pub id: i64,
    pub request_id: i64,
    pub recipient: i64,
    pub assignee: i64,
    pub requested_count: usize,
    pub recipient_name: String,
    pub assignee_name: String,
    pub recipient_email: Option<String>,
    pub relation: Option<String>,
    pub profile_image_url: Option<String>,
    pub mail_sent: bool,
    pub mail_error: Option<String>,
}

impl RecipientQuota {
    /// Quota where recipient and assignee are the same person
    pub fn new(id: i64, request_id: i64, person: i64, requested_count: usize) -> Self {
        Self {
            id,
            request_id,
            recipient: person,
            assignee: person,
            requested_count,
            recipient_name: String::new(),
            assignee_name: String::new(),
            recipient_email: None,
            relation: None,
            profile_image_url: None,
            mail_sent: false,
            mail_error: None,
        }
    }

    /// Whether a unit is bound to this quota's recipient/assignee pair
    pub fn owns(&self, unit: &TreeUnit) -> bool {
        unit.assigned_recipient == Some(self.recipient) && unit.assigned_assignee == Some(self.assignee)
    }
}

// ============================================================================
// Card artifacts
// ============================================================================

/// Rendered card for one assigned unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardArtifact {
    pub id: i64,
    pub request_id: i64,
    pub unit_id: i64,
    pub quota_id: Option<i64>,
    pub slide_id: Option<String>,
    pub container_id: Option<String>,
    pub image_url: Option<String>,
    pub render_error: Option<String>,
    pub render_retries: u32,
    pub updated_at: String,
}

impl CardArtifact {
    pub fn new(id: i64, request_id: i64, unit_id: i64, quota_id: Option<i64>) -> Self {
        Self {
            id,
            request_id,
            unit_id,
            quota_id,
            slide_id: None,
            container_id: None,
            image_url: None,
            render_error: None,
            render_retries: 0,
            updated_at: current_timestamp(),
        }
    }

    pub fn is_rendered(&self) -> bool {
        self.image_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_chain_is_linear() {
        let mut status = RequestStatus::PendingPlotSelection;
        let mut seen = vec![status];
        while let Some(next) = status.next() {
            status = next;
            seen.push(status);
        }
        assert_eq!(
            seen,
            vec![
                RequestStatus::PendingPlotSelection,
                RequestStatus::Reserved,
                RequestStatus::PendingArtifacts,
                RequestStatus::Completed,
            ]
        );
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [RequestStatus::Reserved, RequestStatus::Completed] {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_eligibility_filter() {
        let mut unit = TreeUnit::new(1, 10, "Neem");
        let strict = EligibilityFilter::default();
        assert!(strict.accepts(&unit));

        unit.giftable = false;
        assert!(!strict.accepts(&unit));
        assert!(EligibilityFilter { include_non_giftable: true, ..strict }.accepts(&unit));

        unit.giftable = true;
        unit.habit = "Shrub".into();
        assert!(!strict.accepts(&unit));
        assert!(EligibilityFilter { include_all_habits: true, ..strict }.accepts(&unit));

        unit.habit = TREE_HABIT.into();
        unit.reserved_by_request = Some(3);
        assert!(!strict.accepts(&unit));
    }
}
