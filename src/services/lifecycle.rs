//! Request lifecycle - status transitions and stage orchestration
//!
//! ```text
//! pending_plot_selection --reserve--> reserved --assign--> pending_artifacts --render--> completed
//! ```
//!
//! A status only advances after the stage's postcondition has been read back
//! from the store. Nothing ever moves a request backwards.

use std::sync::Arc;
use tracing::{info, warn};

use crate::cards::pipeline::ArtifactBatchPipeline;
use crate::db::{TreeStore, UnitFilter};
use crate::error::{FulfillmentError, Result};
use crate::models::{RequestStatus, ReservationRequest};

use super::allocator::InventoryAllocator;
use super::assignment::AssignmentEngine;
use super::events::{EventBus, FulfillmentEvent};

/// Move a request one step along the status chain
pub async fn transition(
    store: &dyn TreeStore,
    events: &EventBus,
    request_id: i64,
    from: RequestStatus,
    to: RequestStatus,
) -> Result<()> {
    if from.next() != Some(to) {
        return Err(FulfillmentError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    store.update_request_status(request_id, to).await?;
    info!(request_id = request_id, from = %from, to = %to, "Request status advanced");
    events.emit(FulfillmentEvent::StatusChanged { request_id, from, to });
    Ok(())
}

pub struct RequestLifecycle {
    store: Arc<dyn TreeStore>,
    events: Arc<EventBus>,
    allocator: Arc<InventoryAllocator>,
    assignment: Arc<AssignmentEngine>,
    pipeline: Arc<ArtifactBatchPipeline>,
}

impl RequestLifecycle {
    pub fn new(
        store: Arc<dyn TreeStore>,
        events: Arc<EventBus>,
        allocator: Arc<InventoryAllocator>,
        assignment: Arc<AssignmentEngine>,
        pipeline: Arc<ArtifactBatchPipeline>,
    ) -> Self {
        Self {
            store,
            events,
            allocator,
            assignment,
            pipeline,
        }
    }

    async fn load_request(&self, request_id: i64) -> Result<ReservationRequest> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or_else(|| FulfillmentError::NotFound(format!("request {}", request_id)))
    }

    fn expect_status(request: &ReservationRequest, expected: RequestStatus, to: RequestStatus) -> Result<()> {
        if request.status != expected {
            return Err(FulfillmentError::InvalidTransition {
                from: request.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// Advance to `reserved` once the pledge is fully reserved
    pub async fn mark_reserved(&self, request_id: i64) -> Result<()> {
        let request = self.load_request(request_id).await?;
        Self::expect_status(&request, RequestStatus::PendingPlotSelection, RequestStatus::Reserved)?;

        let stats = self.allocator.reservation_stats(request_id).await?;
        if stats.remaining > 0 {
            return Err(FulfillmentError::Validation(format!(
                "Only {} of {} pledged trees are reserved",
                stats.already_reserved, stats.total_requested
            )));
        }

        transition(
            self.store.as_ref(),
            &self.events,
            request_id,
            request.status,
            RequestStatus::Reserved,
        )
        .await
    }

    /// Advance to `pending_artifacts` once every quota holds its requested units
    pub async fn mark_assigned(&self, request_id: i64) -> Result<()> {
        let request = self.load_request(request_id).await?;
        Self::expect_status(&request, RequestStatus::Reserved, RequestStatus::PendingArtifacts)?;

        let quotas = self.store.read_quotas(request_id).await?;
        if quotas.is_empty() {
            return Err(FulfillmentError::Validation("Request has no recipients".into()));
        }
        let units = self.store.list_request_units(request_id).await?;
        for quota in &quotas {
            let held = units.iter().filter(|unit| quota.owns(unit)).count();
            if held < quota.requested_count {
                return Err(FulfillmentError::Validation(format!(
                    "Recipient quota {} holds {} of {} trees",
                    quota.id, held, quota.requested_count
                )));
            }
        }

        transition(
            self.store.as_ref(),
            &self.events,
            request_id,
            request.status,
            RequestStatus::PendingArtifacts,
        )
        .await
    }

    /// Drive a request through every stage it has not finished yet.
    ///
    /// Stops at the first stage whose postcondition does not hold and
    /// returns the status reached.
    pub async fn process(&self, request_id: i64) -> Result<RequestStatus> {
        loop {
            let request = self.load_request(request_id).await?;
            match request.status {
                RequestStatus::PendingPlotSelection => {
                    let remaining = self.allocator.reservation_stats(request_id).await?.remaining;
                    if remaining > 0 && !request.plots.is_empty() {
                        self.allocator.auto_reserve(request_id).await?;
                    }
                    let reserved = self.store.count_units(&UnitFilter::for_request(request_id)).await?;
                    if reserved < request.pledged_count {
                        warn!(
                            request_id = request_id,
                            reserved = reserved,
                            pledged = request.pledged_count,
                            "Pledge not fully reserved, stopping"
                        );
                        return Ok(request.status);
                    }
                    self.mark_reserved(request_id).await?;
                }
                RequestStatus::Reserved => {
                    let fills = self.assignment.auto_assign(request_id).await?;
                    let shortfall: usize = fills.iter().map(|fill| fill.shortfall).sum();
                    if fills.is_empty() || shortfall > 0 {
                        warn!(
                            request_id = request_id,
                            quotas = fills.len(),
                            shortfall = shortfall,
                            "Recipients not fully assigned, stopping"
                        );
                        return Ok(request.status);
                    }
                    self.mark_assigned(request_id).await?;
                }
                RequestStatus::PendingArtifacts => {
                    self.pipeline.generate_for_request(request_id).await?;
                }
                RequestStatus::Completed => return Ok(RequestStatus::Completed),
            }
        }
    }
}
