//! Assignment engine - binds reserved units to recipient quotas
//!
//! Auto-assignment walks one cursor over the request's unassigned units in id
//! order and hands them to quotas in quota id order. The cursor is never reset
//! between quotas, so when inventory runs short the last quotas take the
//! shortfall.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::concurrency::run_with_concurrency;
use crate::db::{AssignmentFields, TreeStore, UnitFilter, UnitPatch, UnitSelector};
use crate::error::{FulfillmentError, Result};
use crate::models::{current_timestamp, RecipientQuota, RequestKind, ReservationRequest};

use super::events::{EventBus, FulfillmentEvent};
use super::UnitScope;

/// Outcome of auto-assignment for one quota
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaFill {
    pub quota_id: i64,
    /// Units newly assigned by this run
    pub assigned: Vec<i64>,
    /// Requested units that could not be covered
    pub shortfall: usize,
}

/// Explicit unit choice for a quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentPair {
    pub quota_id: i64,
    pub unit_id: i64,
}

/// Fields written on assignment, depending on the request kind
pub fn assignment_fields(request: &ReservationRequest, quota: &RecipientQuota) -> AssignmentFields {
    match request.kind {
        RequestKind::Donation => AssignmentFields {
            recipient: quota.recipient,
            assignee: quota.assignee,
            assigned_at: current_timestamp(),
            description: None,
            event_type: None,
            gifted_by: None,
            gifted_by_name: None,
            user_tree_image: None,
        },
        RequestKind::Gift => AssignmentFields {
            recipient: quota.recipient,
            assignee: quota.assignee,
            assigned_at: request.gifted_on.clone().unwrap_or_else(current_timestamp),
            description: request.event_name.clone(),
            event_type: request.event_type.clone(),
            gifted_by: Some(request.sponsor_user),
            gifted_by_name: request.gifted_by_name.clone(),
            user_tree_image: quota.profile_image_url.clone(),
        },
    }
}

pub struct AssignmentEngine {
    store: Arc<dyn TreeStore>,
    events: Arc<EventBus>,
    /// Concurrent per-quota write limit
    write_limit: usize,
}

impl AssignmentEngine {
    pub fn new(store: Arc<dyn TreeStore>, events: Arc<EventBus>, write_limit: usize) -> Self {
        Self {
            store,
            events,
            write_limit,
        }
    }

    async fn load_request(&self, request_id: i64) -> Result<ReservationRequest> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or_else(|| FulfillmentError::NotFound(format!("request {}", request_id)))
    }

    /// Write one assignment per quota concurrently, then emit events
    async fn write_assignments(&self, request_id: i64, writes: Vec<(i64, Vec<i64>, AssignmentFields)>) -> Result<()> {
        let assigned: Vec<(i64, Vec<i64>)> = writes
            .iter()
            .map(|(quota_id, unit_ids, _)| (*quota_id, unit_ids.clone()))
            .collect();

        let tasks: Vec<_> = writes
            .into_iter()
            .map(|(_, unit_ids, fields)| {
                let store = self.store.clone();
                move || async move {
                    store
                        .update_units(&UnitSelector::Ids(unit_ids), &UnitPatch::Assign(fields))
                        .await
                }
            })
            .collect();
        run_with_concurrency(tasks, self.write_limit).await?;

        for (quota_id, unit_ids) in assigned {
            self.events.emit(FulfillmentEvent::TreesAssigned {
                request_id,
                quota_id,
                unit_ids,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    /// Fill every quota of the request from its reserved, unassigned units.
    pub async fn auto_assign(&self, request_id: i64) -> Result<Vec<QuotaFill>> {
        let started = Instant::now();
        let request = self.load_request(request_id).await?;
        let quotas = self.store.read_quotas(request_id).await?;
        let units = self.store.list_request_units(request_id).await?;

        let mut cursor = 0;
        let mut fills = Vec::with_capacity(quotas.len());
        let mut writes = Vec::new();

        for quota in &quotas {
            let already = units.iter().filter(|unit| quota.owns(unit)).count();
            let mut need = quota.requested_count.saturating_sub(already);
            let mut picked = Vec::new();

            while need > 0 && cursor < units.len() {
                let unit = &units[cursor];
                cursor += 1;
                if unit.is_assigned() {
                    continue;
                }
                picked.push(unit.id);
                need -= 1;
            }

            if need > 0 {
                warn!(
                    request_id = request_id,
                    quota_id = quota.id,
                    requested = quota.requested_count,
                    shortfall = need,
                    "Not enough reserved units to fill quota"
                );
            }
            debug!(request_id = request_id, quota_id = quota.id, already = already, picked = picked.len(), "Quota filled");

            if !picked.is_empty() {
                writes.push((quota.id, picked.clone(), assignment_fields(&request, quota)));
            }
            fills.push(QuotaFill {
                quota_id: quota.id,
                assigned: picked,
                shortfall: need,
            });
        }

        let total: usize = fills.iter().map(|fill| fill.assigned.len()).sum();
        self.write_assignments(request_id, writes).await?;

        info!(
            request_id = request_id,
            quotas = quotas.len(),
            assigned = total,
            duration_ms = started.elapsed().as_millis() as u64,
            "Auto-assigned units"
        );
        Ok(fills)
    }

    /// Assign caller-chosen units, all or nothing.
    pub async fn assign_explicit(&self, request_id: i64, pairs: &[AssignmentPair]) -> Result<usize> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let request = self.load_request(request_id).await?;
        let quotas: BTreeMap<i64, RecipientQuota> = self
            .store
            .read_quotas(request_id)
            .await?
            .into_iter()
            .map(|quota| (quota.id, quota))
            .collect();

        let unit_ids: Vec<i64> = pairs
            .iter()
            .map(|pair| pair.unit_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if unit_ids.len() != pairs.len() {
            return Err(FulfillmentError::Validation("A tree can only be assigned once".into()));
        }

        let owned = self.store.count_units(&UnitFilter::in_request(request_id, &unit_ids)).await?;
        if owned != unit_ids.len() {
            return Err(FulfillmentError::Validation(
                "Some trees are not part of this request".into(),
            ));
        }

        let mut grouped: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for pair in pairs {
            if !quotas.contains_key(&pair.quota_id) {
                return Err(FulfillmentError::Validation(format!(
                    "Recipient quota {} is not part of this request",
                    pair.quota_id
                )));
            }
            grouped.entry(pair.quota_id).or_default().push(pair.unit_id);
        }

        let writes = grouped
            .into_iter()
            .filter_map(|(quota_id, ids)| {
                quotas
                    .get(&quota_id)
                    .map(|quota| (quota_id, ids, assignment_fields(&request, quota)))
            })
            .collect();
        self.write_assignments(request_id, writes).await?;

        info!(request_id = request_id, assigned = pairs.len(), "Assigned selected units");
        Ok(pairs.len())
    }

    /// Clear assignment fields, keeping the reservation.
    pub async fn unassign(&self, request_id: i64, scope: &UnitScope) -> Result<usize> {
        let selector = match scope {
            UnitScope::All => UnitSelector::Request(request_id),
            UnitScope::Ids(ids) => {
                if ids.is_empty() {
                    return Ok(0);
                }
                let owned = self.store.count_units(&UnitFilter::in_request(request_id, ids)).await?;
                if owned != ids.len() {
                    return Err(FulfillmentError::Validation(
                        "Some trees are not part of this request".into(),
                    ));
                }
                UnitSelector::Ids(ids.clone())
            }
        };

        let cleared = self.store.update_units(&selector, &UnitPatch::ClearAssignment).await?;
        info!(request_id = request_id, cleared = cleared, "Unassigned units");
        self.events.emit(FulfillmentEvent::TreesUnassigned {
            request_id,
            count: cleared,
        });
        Ok(cleared)
    }

    // =========================================================================
    // Quotas
    // =========================================================================

    /// Insert or replace quotas. The summed quota counts may not exceed the pledge.
    pub async fn upsert_quotas(&self, request_id: i64, quotas: &[RecipientQuota]) -> Result<()> {
        let request = self.load_request(request_id).await?;
        if let Some(foreign) = quotas.iter().find(|quota| quota.request_id != request_id) {
            return Err(FulfillmentError::Validation(format!(
                "Recipient quota {} belongs to request {}",
                foreign.id, foreign.request_id
            )));
        }

        let mut merged: BTreeMap<i64, usize> = self
            .store
            .read_quotas(request_id)
            .await?
            .into_iter()
            .map(|quota| (quota.id, quota.requested_count))
            .collect();
        for quota in quotas {
            merged.insert(quota.id, quota.requested_count);
        }
        let total: usize = merged.values().sum();
        if total > request.pledged_count {
            return Err(FulfillmentError::Validation(format!(
                "Recipients request {} trees but only {} were pledged",
                total, request.pledged_count
            )));
        }

        for quota in quotas {
            self.store.upsert_quota(quota).await?;
        }
        debug!(request_id = request_id, quotas = quotas.len(), total = total, "Upserted recipient quotas");
        Ok(())
    }

    /// Unassign every unit held by the quotas, then delete them.
    pub async fn remove_quotas(&self, request_id: i64, quota_ids: &[i64]) -> Result<usize> {
        let removed: Vec<RecipientQuota> = self
            .store
            .read_quotas(request_id)
            .await?
            .into_iter()
            .filter(|quota| quota_ids.contains(&quota.id))
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }

        let held: Vec<i64> = self
            .store
            .list_request_units(request_id)
            .await?
            .iter()
            .filter(|unit| removed.iter().any(|quota| quota.owns(unit)))
            .map(|unit| unit.id)
            .collect();
        if !held.is_empty() {
            self.unassign(request_id, &UnitScope::Ids(held)).await?;
        }

        let ids: Vec<i64> = removed.iter().map(|quota| quota.id).collect();
        let deleted = self.store.delete_quotas(request_id, &ids).await?;
        info!(request_id = request_id, deleted = deleted, "Removed recipient quotas");
        Ok(deleted)
    }
}
