//! In-process tree store
//!
//! Keeps rows in ordered maps behind a mutex. Used by tests and for dry runs
//! of the pipeline without a database file.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{TreeStore, UnitFilter, UnitPatch, UnitSelector};
use crate::error::{FulfillmentError, Result};
use crate::models::{
    current_timestamp, CardArtifact, EligibilityFilter, RecipientQuota, RequestStatus,
    ReservationRequest, TreeUnit,
};

#[derive(Default)]
struct MemoryState {
    units: BTreeMap<i64, TreeUnit>,
    requests: BTreeMap<i64, ReservationRequest>,
    quotas: BTreeMap<i64, RecipientQuota>,
    cards: BTreeMap<i64, CardArtifact>,
    templates: HashMap<String, String>,
    next_card_id: i64,
}

/// Tree store holding every row in memory
#[derive(Default)]
pub struct MemoryTreeStore {
    state: Mutex<MemoryState>,
    fail_unit_updates: AtomicBool,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `update_units` call fail with a persistence error
    pub fn fail_unit_updates(&self, fail: bool) {
        self.fail_unit_updates.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of a single unit
    pub fn unit(&self, id: i64) -> Option<TreeUnit> {
        self.lock().ok().and_then(|state| state.units.get(&id).cloned())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| FulfillmentError::Persistence(format!("Lock poisoned: {}", e)))
    }
}

#[async_trait]
impl TreeStore for MemoryTreeStore {
    async fn fetch_free_units(&self, plot_id: i64, limit: usize, filter: EligibilityFilter) -> Result<Vec<TreeUnit>> {
        let state = self.lock()?;
        let eligible = state
            .units
            .values()
            .filter(|unit| unit.plot_id == plot_id && filter.accepts(unit));

        if !filter.diversify {
            return Ok(eligible.take(limit).cloned().collect());
        }

        let mut per_type: HashMap<&str, usize> = HashMap::new();
        let mut picked = Vec::new();
        for unit in eligible {
            let taken = per_type.entry(unit.plant_type.as_str()).or_insert(0);
            if *taken < limit {
                *taken += 1;
                picked.push(unit.clone());
            }
        }
        Ok(picked)
    }

    async fn count_units(&self, filter: &UnitFilter) -> Result<usize> {
        let state = self.lock()?;
        Ok(state.units.values().filter(|unit| filter.matches(unit)).count())
    }

    async fn update_units(&self, selector: &UnitSelector, patch: &UnitPatch) -> Result<usize> {
        if self.fail_unit_updates.load(Ordering::SeqCst) {
            return Err(FulfillmentError::Persistence("unit updates disabled".into()));
        }

        let mut state = self.lock()?;
        let mut affected = 0;
        for unit in state.units.values_mut().filter(|unit| selector.matches(unit)) {
            patch.apply(unit);
            affected += 1;
        }
        Ok(affected)
    }

    async fn list_request_units(&self, request_id: i64) -> Result<Vec<TreeUnit>> {
        let state = self.lock()?;
        Ok(state
            .units
            .values()
            .filter(|unit| unit.reserved_by_request == Some(request_id))
            .cloned()
            .collect())
    }

    async fn insert_units(&self, units: &[TreeUnit]) -> Result<()> {
        let mut state = self.lock()?;
        for unit in units {
            state.units.insert(unit.id, unit.clone());
        }
        Ok(())
    }

    async fn get_request(&self, request_id: i64) -> Result<Option<ReservationRequest>> {
        Ok(self.lock()?.requests.get(&request_id).cloned())
    }

    async fn insert_request(&self, request: &ReservationRequest) -> Result<()> {
        self.lock()?.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn update_request_status(&self, request_id: i64, status: RequestStatus) -> Result<()> {
        let mut state = self.lock()?;
        let request = state
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| FulfillmentError::NotFound(format!("request {}", request_id)))?;
        request.status = status;
        request.updated_at = current_timestamp();
        Ok(())
    }

    async fn read_quotas(&self, request_id: i64) -> Result<Vec<RecipientQuota>> {
        let state = self.lock()?;
        Ok(state
            .quotas
            .values()
            .filter(|quota| quota.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn upsert_quota(&self, quota: &RecipientQuota) -> Result<()> {
        self.lock()?.quotas.insert(quota.id, quota.clone());
        Ok(())
    }

    async fn delete_quotas(&self, request_id: i64, quota_ids: &[i64]) -> Result<usize> {
        let mut state = self.lock()?;
        let before = state.quotas.len();
        state
            .quotas
            .retain(|id, quota| !(quota.request_id == request_id && quota_ids.contains(id)));
        Ok(before - state.quotas.len())
    }

    async fn update_quota_mail(&self, quota_id: i64, mail_sent: bool, mail_error: Option<String>) -> Result<()> {
        let mut state = self.lock()?;
        let quota = state
            .quotas
            .get_mut(&quota_id)
            .ok_or_else(|| FulfillmentError::NotFound(format!("quota {}", quota_id)))?;
        quota.mail_sent = mail_sent;
        quota.mail_error = mail_error;
        Ok(())
    }

    async fn template_slots(&self) -> Result<HashMap<String, String>> {
        Ok(self.lock()?.templates.clone())
    }

    async fn set_template_slot(&self, plant_type: &str, slot_id: &str) -> Result<()> {
        self.lock()?
            .templates
            .insert(plant_type.to_string(), slot_id.to_string());
        Ok(())
    }

    async fn list_cards(&self, request_id: i64) -> Result<Vec<CardArtifact>> {
        let state = self.lock()?;
        Ok(state
            .cards
            .values()
            .filter(|card| card.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn insert_card(&self, request_id: i64, unit_id: i64, quota_id: Option<i64>) -> Result<CardArtifact> {
        let mut state = self.lock()?;
        state.next_card_id += 1;
        let card = CardArtifact::new(state.next_card_id, request_id, unit_id, quota_id);
        state.cards.insert(card.id, card.clone());
        Ok(card)
    }

    async fn update_card(&self, card: &CardArtifact) -> Result<()> {
        let mut state = self.lock()?;
        if !state.cards.contains_key(&card.id) {
            return Err(FulfillmentError::NotFound(format!("card {}", card.id)));
        }
        state.cards.insert(card.id, card.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ReservationClaim;

    fn plot_units(plot_id: i64, start: i64, types: &[&str]) -> Vec<TreeUnit> {
        types
            .iter()
            .enumerate()
            .map(|(i, plant_type)| TreeUnit::new(start + i as i64, plot_id, *plant_type))
            .collect()
    }

    #[tokio::test]
    async fn test_fetch_free_units_diversified() {
        let store = MemoryTreeStore::new();
        store
            .insert_units(&plot_units(1, 1, &["Neem", "Neem", "Neem", "Peepal", "Banyan"]))
            .await
            .unwrap();

        let plain = store.fetch_free_units(1, 2, EligibilityFilter::default()).await.unwrap();
        assert_eq!(plain.iter().map(|u| u.id).collect::<Vec<_>>(), vec![1, 2]);

        let diverse = store
            .fetch_free_units(1, 2, EligibilityFilter { diversify: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(diverse.iter().map(|u| u.id).collect::<Vec<_>>(), vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn test_reserve_checked_rejects_taken_units() {
        let store = MemoryTreeStore::new();
        let mut units = plot_units(1, 1, &["Neem", "Neem"]);
        units[1].reserved_by_request = Some(99);
        store.insert_units(&units).await.unwrap();

        let claim = ReservationClaim {
            request_id: 1,
            pledged_count: 5,
            unit_ids: vec![1, 2],
            sponsor_user: 10,
            sponsor_group: None,
            require_free: true,
        };
        assert!(matches!(
            store.reserve_checked(&claim).await,
            Err(FulfillmentError::Validation(_))
        ));
        assert_eq!(store.count_units(&UnitFilter::for_request(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_updates() {
        let store = MemoryTreeStore::new();
        store.insert_units(&plot_units(1, 1, &["Neem"])).await.unwrap();
        store.fail_unit_updates(true);
        let result = store
            .update_units(&UnitSelector::Ids(vec![1]), &UnitPatch::ClearAssignment)
            .await;
        assert!(matches!(result, Err(FulfillmentError::Persistence(_))));
    }
}
