//! Inventory allocator - reserves tree units for requests
//!
//! Reservation never writes more units than a request pledged. The pledge
//! check and the write go through [`TreeStore::reserve_checked`], which is the
//! only place a read-check-write window exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::db::{ReservationClaim, TreeStore, UnitFilter, UnitPatch, UnitSelector};
use crate::error::{FulfillmentError, Result};
use crate::models::{EligibilityFilter, PlotDemand, ReservationRequest, ReservationStats, TreeUnit};

use super::events::{EventBus, FulfillmentEvent};
use super::UnitScope;

/// Parameters of a plot-driven reservation
#[derive(Debug, Clone, PartialEq)]
pub struct PlotReservation {
    pub request_id: i64,
    pub user_id: i64,
    pub group_id: Option<i64>,
    pub plots: Vec<PlotDemand>,
    pub filter: EligibilityFilter,
}

impl PlotReservation {
    /// Reserve for the request's own plots and flags
    pub fn for_request(request: &ReservationRequest) -> Self {
        Self {
            request_id: request.id,
            user_id: request.sponsor_user,
            group_id: request.sponsor_group,
            plots: request.plots.clone(),
            filter: request.filter(),
        }
    }
}

/// Pick up to `max_count` units, one per plant type per pass.
///
/// Buckets are ordered by first appearance of their plant type in
/// `candidates`. Every bucket gives one unit before any bucket gives a second.
pub fn distribute_by_plant_type(candidates: &[TreeUnit], max_count: usize) -> Vec<i64> {
    let mut bucket_index: HashMap<&str, usize> = HashMap::new();
    let mut buckets: Vec<Vec<i64>> = Vec::new();

    for unit in candidates {
        let index = *bucket_index.entry(unit.plant_type.as_str()).or_insert_with(|| {
            buckets.push(Vec::new());
            buckets.len() - 1
        });
        buckets[index].push(unit.id);
    }

    let mut selected = Vec::with_capacity(max_count.min(candidates.len()));
    let mut pass = 0;
    while selected.len() < max_count {
        let mut picked_any = false;
        for bucket in &buckets {
            if let Some(&id) = bucket.get(pass) {
                picked_any = true;
                selected.push(id);
                if selected.len() == max_count {
                    break;
                }
            }
        }
        if !picked_any {
            break;
        }
        pass += 1;
    }

    selected
}

/// Combine demands on the same plot, keeping first-seen plot order
pub fn merge_demands(plots: &[PlotDemand]) -> Vec<PlotDemand> {
    let mut merged: Vec<PlotDemand> = Vec::with_capacity(plots.len());
    for demand in plots {
        match merged.iter_mut().find(|m| m.plot_id == demand.plot_id) {
            Some(existing) => existing.desired_count += demand.desired_count,
            None => merged.push(*demand),
        }
    }
    merged
}

/// Reserves, releases and reports on tree units for requests
pub struct InventoryAllocator {
    store: Arc<dyn TreeStore>,
    events: Arc<EventBus>,
}

impl InventoryAllocator {
    pub fn new(store: Arc<dyn TreeStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    async fn load_request(&self, request_id: i64) -> Result<ReservationRequest> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or_else(|| FulfillmentError::NotFound(format!("request {}", request_id)))
    }

    // =========================================================================
    // Reservation
    // =========================================================================

    /// Reserve free units from each plot, diversified by plant type.
    ///
    /// Plots that cannot satisfy their demand contribute what they have. The
    /// whole call fails without writing if the result would push the request
    /// past its pledge.
    pub async fn reserve_in_plots(&self, reservation: &PlotReservation) -> Result<Vec<i64>> {
        let started = Instant::now();
        let request = self.load_request(reservation.request_id).await?;

        let mut final_ids = Vec::new();
        for demand in &merge_demands(&reservation.plots) {
            if demand.desired_count == 0 {
                continue;
            }
            let candidates = self
                .store
                .fetch_free_units(demand.plot_id, demand.desired_count, reservation.filter)
                .await?;
            let selected = distribute_by_plant_type(&candidates, demand.desired_count);
            debug!(
                request_id = request.id,
                plot_id = demand.plot_id,
                desired = demand.desired_count,
                candidates = candidates.len(),
                selected = selected.len(),
                "Selected units from plot"
            );
            final_ids.extend(selected);
        }

        if final_ids.is_empty() {
            info!(request_id = request.id, "No free units available in requested plots");
            return Ok(final_ids);
        }

        self.store
            .reserve_checked(&ReservationClaim {
                request_id: request.id,
                pledged_count: request.pledged_count,
                unit_ids: final_ids.clone(),
                sponsor_user: reservation.user_id,
                sponsor_group: reservation.group_id,
                require_free: false,
            })
            .await?;

        info!(
            request_id = request.id,
            reserved = final_ids.len(),
            plots = reservation.plots.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Reserved units in plots"
        );
        self.events.emit(FulfillmentEvent::TreesReserved {
            request_id: request.id,
            unit_ids: final_ids.clone(),
        });

        Ok(final_ids)
    }

    /// Reserve the request's own plot demands.
    ///
    /// Rejects up front when the summed demand alone exceeds the pledge.
    /// Otherwise each plot is asked only for what it has not yet supplied,
    /// trimmed in plot order to the part of the pledge still open, so a
    /// partially reserved request can be topped up by calling again.
    pub async fn auto_reserve(&self, request_id: i64) -> Result<Vec<i64>> {
        let request = self.load_request(request_id).await?;
        let demands = merge_demands(&request.plots);
        let demanded: usize = demands.iter().map(|plot| plot.desired_count).sum();

        if demanded > request.pledged_count {
            let already_reserved = self.store.count_units(&UnitFilter::for_request(request_id)).await?;
            return Err(FulfillmentError::Overbooking {
                requested: demanded,
                already_reserved,
                pledged: request.pledged_count,
            });
        }

        let reserved = self.store.list_request_units(request_id).await?;
        let mut left = request.pledged_count.saturating_sub(reserved.len());
        if left == 0 {
            debug!(request_id = request_id, "Pledge already reserved");
            return Ok(Vec::new());
        }

        let mut outstanding = Vec::with_capacity(demands.len());
        for demand in demands {
            let supplied = reserved.iter().filter(|unit| unit.plot_id == demand.plot_id).count();
            let wanted = demand.desired_count.saturating_sub(supplied).min(left);
            if wanted > 0 {
                left -= wanted;
                outstanding.push(PlotDemand::new(demand.plot_id, wanted));
            }
        }

        self.reserve_in_plots(&PlotReservation {
            plots: outstanding,
            ..PlotReservation::for_request(&request)
        })
        .await
    }

    /// Reserve exactly `unit_ids`, or nothing.
    pub async fn reserve_exact(&self, request_id: i64, unit_ids: &[i64]) -> Result<usize> {
        let request = self.load_request(request_id).await?;

        let reserved = self
            .store
            .reserve_checked(&ReservationClaim {
                request_id,
                pledged_count: request.pledged_count,
                unit_ids: unit_ids.to_vec(),
                sponsor_user: request.sponsor_user,
                sponsor_group: request.sponsor_group,
                require_free: true,
            })
            .await?;

        info!(request_id = request_id, reserved = reserved, "Reserved selected units");
        if reserved > 0 {
            self.events.emit(FulfillmentEvent::TreesReserved {
                request_id,
                unit_ids: unit_ids.to_vec(),
            });
        }
        Ok(reserved)
    }

    /// Release reserved units.
    ///
    /// Does not look at assignment state; callers unassign first.
    pub async fn unreserve(&self, request_id: i64, scope: &UnitScope) -> Result<usize> {
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

        let released = self.store.update_units(&selector, &UnitPatch::ClearReservation).await?;
        info!(request_id = request_id, released = released, "Unreserved units");
        self.events.emit(FulfillmentEvent::TreesUnreserved {
            request_id,
            count: released,
        });
        Ok(released)
    }

    /// Pledged, reserved and remaining counts of a request
    pub async fn reservation_stats(&self, request_id: i64) -> Result<ReservationStats> {
        let request = self.load_request(request_id).await?;
        let already_reserved = self.store.count_units(&UnitFilter::for_request(request_id)).await?;

        Ok(ReservationStats {
            total_requested: request.pledged_count,
            already_reserved,
            remaining: request.pledged_count.saturating_sub(already_reserved),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryTreeStore;
    use crate::models::RequestKind;

    fn units(types: &[(&str, usize)]) -> Vec<TreeUnit> {
        let mut id = 0;
        let mut out = Vec::new();
        for (plant_type, count) in types {
            for _ in 0..*count {
                id += 1;
                out.push(TreeUnit::new(id, 1, *plant_type));
            }
        }
        out
    }

    #[test]
    fn test_distribute_covers_all_types_before_repeating() {
        // A: 1,2,3  B: 4  C: 5,6
        let candidates = units(&[("A", 3), ("B", 1), ("C", 2)]);
        assert_eq!(distribute_by_plant_type(&candidates, 4), vec![1, 4, 5, 2]);
    }

    #[test]
    fn test_distribute_stops_when_buckets_run_dry() {
        let candidates = units(&[("A", 2), ("B", 1)]);
        assert_eq!(distribute_by_plant_type(&candidates, 10), vec![1, 3, 2]);
        assert!(distribute_by_plant_type(&candidates, 0).is_empty());
        assert!(distribute_by_plant_type(&[], 5).is_empty());
    }

    #[test]
    fn test_distribute_keeps_first_seen_bucket_order() {
        let mut candidates = units(&[("A", 2), ("B", 2)]);
        candidates.swap(0, 2);
        // order is now B(3), A(2), A(1), B(4)
        assert_eq!(distribute_by_plant_type(&candidates, 3), vec![3, 2, 4]);
    }

    async fn allocator_with(pledged: usize, plot_sizes: &[(i64, usize)]) -> (InventoryAllocator, Arc<MemoryTreeStore>) {
        let store = Arc::new(MemoryTreeStore::new());
        let mut id = 0;
        let mut all = Vec::new();
        for (plot_id, size) in plot_sizes {
            for n in 0..*size {
                id += 1;
                all.push(TreeUnit::new(id, *plot_id, if n % 2 == 0 { "Neem" } else { "Jamun" }));
            }
        }
        store.insert_units(&all).await.unwrap();
        store
            .insert_request(&ReservationRequest::new(1, RequestKind::Donation, 50, pledged))
            .await
            .unwrap();
        (InventoryAllocator::new(store.clone(), Arc::new(EventBus::new())), store)
    }

    fn plots(demands: &[(i64, usize)]) -> PlotReservation {
        PlotReservation {
            request_id: 1,
            user_id: 50,
            group_id: None,
            plots: demands.iter().map(|(p, n)| PlotDemand::new(*p, *n)).collect(),
            filter: EligibilityFilter { diversify: true, ..Default::default() },
        }
    }

    #[tokio::test]
    async fn test_reserve_in_plots_never_exceeds_pledge() {
        let (allocator, store) = allocator_with(5, &[(1, 10)]).await;

        assert_eq!(allocator.reserve_in_plots(&plots(&[(1, 3)])).await.unwrap().len(), 3);
        let err = allocator.reserve_in_plots(&plots(&[(1, 3)])).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Overbooking { already_reserved: 3, requested: 3, pledged: 5 }));
        assert_eq!(store.count_units(&UnitFilter::for_request(1)).await.unwrap(), 3);

        assert_eq!(allocator.reserve_in_plots(&plots(&[(1, 2)])).await.unwrap().len(), 2);
        assert_eq!(store.count_units(&UnitFilter::for_request(1)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_reserve_exact_is_all_or_nothing() {
        let (allocator, store) = allocator_with(10, &[(1, 5)]).await;
        store
            .update_units(
                &UnitSelector::Ids(vec![3]),
                &UnitPatch::Reserve {
                    request_id: 2,
                    sponsor_user: 99,
                    sponsor_group: None,
                },
            )
            .await
            .unwrap();

        let err = allocator.reserve_exact(1, &[1, 2, 3, 4, 5]).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Validation(_)));
        assert_eq!(store.count_units(&UnitFilter::for_request(1)).await.unwrap(), 0);

        assert_eq!(allocator.reserve_exact(1, &[1, 2]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reserve_exact_rejects_overbooking() {
        let (allocator, store) = allocator_with(2, &[(1, 5)]).await;
        let err = allocator.reserve_exact(1, &[1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Overbooking { .. }));
        assert_eq!(store.count_units(&UnitFilter::for_request(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreserve_validates_ids() {
        let (allocator, store) = allocator_with(4, &[(1, 6)]).await;
        allocator.reserve_exact(1, &[1, 2, 3]).await.unwrap();

        let err = allocator.unreserve(1, &UnitScope::Ids(vec![1, 6])).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Validation(_)));

        assert_eq!(allocator.unreserve(1, &UnitScope::Ids(vec![1])).await.unwrap(), 1);
        assert_eq!(allocator.unreserve(1, &UnitScope::All).await.unwrap(), 2);
        assert_eq!(store.count_units(&UnitFilter::for_request(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reserve_in_plots_merges_repeated_plots() {
        let (allocator, store) = allocator_with(10, &[(1, 6)]).await;

        let mut reserved = allocator.reserve_in_plots(&plots(&[(1, 2), (1, 2)])).await.unwrap();
        reserved.sort();
        assert_eq!(reserved, vec![1, 2, 3, 4]);
        assert_eq!(store.count_units(&UnitFilter::for_request(1)).await.unwrap(), 4);
    }

    #[test]
    fn test_merge_demands_sums_per_plot() {
        let merged = merge_demands(&[PlotDemand::new(2, 1), PlotDemand::new(1, 2), PlotDemand::new(2, 3)]);
        assert_eq!(merged, vec![PlotDemand::new(2, 4), PlotDemand::new(1, 2)]);
    }

    #[tokio::test]
    async fn test_auto_reserve_tops_up_after_partial_reservation() {
        let (allocator, store) = allocator_with(10, &[(1, 5)]).await;
        let mut request = store.get_request(1).await.unwrap().unwrap();
        request.plots = vec![PlotDemand::new(1, 10)];
        store.insert_request(&request).await.unwrap();

        assert_eq!(allocator.auto_reserve(1).await.unwrap().len(), 5);

        let more: Vec<TreeUnit> = (6..=10).map(|id| TreeUnit::new(id, 1, "Neem")).collect();
        store.insert_units(&more).await.unwrap();
        assert_eq!(allocator.auto_reserve(1).await.unwrap().len(), 5);
        assert_eq!(store.count_units(&UnitFilter::for_request(1)).await.unwrap(), 10);

        // Nothing left to reserve
        assert!(allocator.auto_reserve(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_reserve_asks_short_plots_first() {
        let (allocator, store) = allocator_with(6, &[(1, 6), (2, 2)]).await;
        let mut request = store.get_request(1).await.unwrap().unwrap();
        request.plots = vec![PlotDemand::new(1, 3), PlotDemand::new(2, 3)];
        store.insert_request(&request).await.unwrap();

        assert_eq!(allocator.auto_reserve(1).await.unwrap().len(), 5);

        store.insert_units(&[TreeUnit::new(20, 2, "Neem")]).await.unwrap();
        assert_eq!(allocator.auto_reserve(1).await.unwrap(), vec![20]);
    }

    #[tokio::test]
    async fn test_auto_reserve_checks_summed_demand() {
        let (allocator, store) = allocator_with(4, &[(1, 6), (2, 6)]).await;
        let mut request = store.get_request(1).await.unwrap().unwrap();
        request.plots = vec![PlotDemand::new(1, 3), PlotDemand::new(2, 2)];
        store.insert_request(&request).await.unwrap();

        assert!(matches!(
            allocator.auto_reserve(1).await,
            Err(FulfillmentError::Overbooking { requested: 5, .. })
        ));

        request.plots = vec![PlotDemand::new(1, 2), PlotDemand::new(2, 2)];
        store.insert_request(&request).await.unwrap();
        assert_eq!(allocator.auto_reserve(1).await.unwrap().len(), 4);

        let stats = allocator.reservation_stats(1).await.unwrap();
        assert_eq!(
            stats,
            ReservationStats {
                total_requested: 4,
                already_reserved: 4,
                remaining: 0
            }
        );
    }
}
