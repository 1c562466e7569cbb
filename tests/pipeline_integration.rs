//! End-to-end runs of reservation, assignment and card generation against
//! in-process collaborators.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use grove_fulfillment::cards::NO_TEMPLATE_ERROR;
use grove_fulfillment::notify::{OutgoingMail, MULTI_TREE_TEMPLATE};
use grove_fulfillment::{
    Collaborators, Config, FulfillmentError, MemoryTreeStore, NotificationOptions, Notifier,
    ObjectStore, PlotDemand, Rasterizer, RecipientQuota, RequestKind, RequestStatus,
    ReservationRequest, Services, SlideService, SlotRecord, SqliteTreeStore, TreeStore, TreeUnit,
};

type Result<T> = grove_fulfillment::Result<T>;

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct SlideState {
    next_container: usize,
    next_slot: usize,
    container_names: Vec<String>,
    slots: HashMap<String, Vec<String>>,
    records: Vec<SlotRecord>,
    thumbnail_calls: HashMap<String, u32>,
}

/// Slide service keeping containers in memory.
///
/// Every container starts with one template slot per plant type.
#[derive(Default)]
struct FakeSlides {
    state: Mutex<SlideState>,
    fail_export: bool,
    /// Failed thumbnail calls per slot before one succeeds
    thumbnail_failures: u32,
    /// Create one slot fewer than asked for
    short_slots: bool,
}

impl FakeSlides {
    fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().container_names.clone()
    }

    fn records(&self) -> Vec<SlotRecord> {
        self.state.lock().unwrap().records.clone()
    }

    fn slots(&self, container_id: &str) -> Vec<String> {
        self.state.lock().unwrap().slots.get(container_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl SlideService for FakeSlides {
    async fn duplicate_container(&self, _template_id: &str, name: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_container += 1;
        let id = format!("container-{}", state.next_container);
        state.container_names.push(name.to_string());
        state.slots.insert(id.clone(), vec!["tpl-neem".into(), "tpl-mango".into()]);
        Ok(id)
    }

    async fn create_slots(&self, container_id: &str, template_slot_ids: &[String]) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        let mut created = Vec::new();
        let wanted = template_slot_ids.len() - usize::from(self.short_slots && !template_slot_ids.is_empty());
        for _ in 0..wanted {
            state.next_slot += 1;
            created.push(format!("slot-{}", state.next_slot));
        }
        state
            .slots
            .get_mut(container_id)
            .ok_or_else(|| FulfillmentError::NotFound(container_id.to_string()))?
            .extend(created.iter().cloned());
        Ok(created)
    }

    async fn bulk_update_slots(&self, _container_id: &str, records: &[SlotRecord]) -> Result<()> {
        self.state.lock().unwrap().records.extend(records.iter().cloned());
        Ok(())
    }

    async fn list_slots(&self, container_id: &str) -> Result<Vec<String>> {
        Ok(self.slots(container_id))
    }

    async fn delete_slots(&self, container_id: &str, slot_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(slots) = state.slots.get_mut(container_id) {
            slots.retain(|slot| !slot_ids.contains(slot));
        }
        Ok(())
    }

    async fn reorder_slots(&self, container_id: &str, slot_ids: &[String]) -> Result<()> {
        self.state.lock().unwrap().slots.insert(container_id.to_string(), slot_ids.to_vec());
        Ok(())
    }

    async fn export_as_document(&self, container_id: &str, _mime_type: &str) -> Result<Bytes> {
        if self.fail_export {
            return Err(FulfillmentError::External("export quota exceeded".into()));
        }
        Ok(Bytes::from(self.slots(container_id).join("\n")))
    }

    async fn export_slot_thumbnail(&self, _container_id: &str, slot_id: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let calls = state.thumbnail_calls.entry(slot_id.to_string()).or_insert(0);
        *calls += 1;
        if *calls <= self.thumbnail_failures {
            return Err(FulfillmentError::External("thumbnail not ready".into()));
        }
        Ok(format!("https://slides.test/{}.png", slot_id))
    }
}

/// One page per line of the document
struct LineRasterizer;

#[async_trait]
impl Rasterizer for LineRasterizer {
    async fn split_pages(&self, document: Bytes) -> Result<Vec<Bytes>> {
        Ok(document
            .split(|byte| *byte == b'\n')
            .map(Bytes::copy_from_slice)
            .collect())
    }
}

#[derive(Default)]
struct FakeObjects {
    keys: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectStore for FakeObjects {
    async fn upload(&self, _bytes: Bytes, key: &str) -> Result<String> {
        self.keys.lock().unwrap().push(key.to_string());
        Ok(format!("https://cards.test/{}", key))
    }

    async fn mirror(&self, _source_url: &str, key: &str) -> Result<String> {
        self.keys.lock().unwrap().push(key.to_string());
        Ok(format!("https://cards.test/{}", key))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    mails: Mutex<Vec<OutgoingMail>>,
    /// Provider message returned for every mail when set
    reject: Mutex<Option<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, mail: &OutgoingMail) -> Result<Option<String>> {
        self.mails.lock().unwrap().push(mail.clone());
        Ok(self.reject.lock().unwrap().clone())
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Harness {
    services: Services,
    store: Arc<dyn TreeStore>,
    slides: Arc<FakeSlides>,
    objects: Arc<FakeObjects>,
    notifier: Arc<RecordingNotifier>,
}

fn config(batch_size: usize) -> Config {
    Config {
        template_container_id: "template-deck".into(),
        batch_size,
        retry_base_secs: 0,
        ..Config::default()
    }
}

fn harness(store: Arc<dyn TreeStore>, slides: FakeSlides, config: &Config) -> Harness {
    let slides = Arc::new(slides);
    let objects = Arc::new(FakeObjects::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let collaborators = Collaborators {
        slides: slides.clone(),
        objects: objects.clone(),
        rasterizer: Arc::new(LineRasterizer),
        notifier: notifier.clone(),
    };
    Harness {
        services: Services::new(store.clone(), collaborators, config),
        store,
        slides,
        objects,
        notifier,
    }
}

/// Plot 1 alternates Neem and Mango, plot 2 is all Neem.
async fn seed(store: &dyn TreeStore) {
    let mut units = Vec::new();
    for id in 1..=8 {
        let plant_type = if id % 2 == 0 { "Mango" } else { "Neem" };
        units.push(TreeUnit::new(id, 1, plant_type));
    }
    for id in 9..=13 {
        units.push(TreeUnit::new(id, 2, "Neem"));
    }
    store.insert_units(&units).await.unwrap();
    store.set_template_slot("Neem", "tpl-neem").await.unwrap();
    store.set_template_slot("Mango", "tpl-mango").await.unwrap();

    let mut request = ReservationRequest::new(1, RequestKind::Gift, 50, 10);
    request.sponsor_name = "Green Co".into();
    request.diversify = true;
    request.plots = vec![PlotDemand::new(1, 6), PlotDemand::new(2, 4)];
    store.insert_request(&request).await.unwrap();

    let mut asha = RecipientQuota::new(1, 1, 100, 3);
    asha.recipient_name = "Asha".into();
    asha.assignee_name = "Asha".into();
    asha.recipient_email = Some("asha@example.org".into());
    let mut guest = RecipientQuota::new(2, 1, 200, 7);
    guest.recipient_name = "Guest".into();
    guest.assignee_name = "Guest".into();
    guest.recipient_email = Some("guest.200@14trees".into());
    store.upsert_quota(&asha).await.unwrap();
    store.upsert_quota(&guest).await.unwrap();
}

async fn memory_harness(slides: FakeSlides, config: &Config) -> Harness {
    let store: Arc<dyn TreeStore> = Arc::new(MemoryTreeStore::new());
    seed(store.as_ref()).await;
    harness(store, slides, config)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_process_completes_request() {
    let h = memory_harness(FakeSlides::default(), &config(200)).await;

    let status = h.services.lifecycle.process(1).await.unwrap();
    assert_eq!(status, RequestStatus::Completed);

    let units = h.store.list_request_units(1).await.unwrap();
    assert_eq!(units.len(), 10);
    let plot_one: Vec<&TreeUnit> = units.iter().filter(|unit| unit.plot_id == 1).collect();
    assert_eq!(plot_one.len(), 6);
    assert_eq!(plot_one.iter().filter(|unit| unit.plant_type == "Mango").count(), 3);

    let quotas = h.store.read_quotas(1).await.unwrap();
    for quota in &quotas {
        let held = units.iter().filter(|unit| quota.owns(unit)).count();
        assert_eq!(held, quota.requested_count);
    }
    assert!(units.iter().all(|unit| unit.gifted_by == Some(50)));

    let cards = h.store.list_cards(1).await.unwrap();
    assert_eq!(cards.len(), 10);
    for card in &cards {
        let url = card.image_url.as_deref().unwrap();
        assert!(url.starts_with("https://cards.test/"), "{}", url);
        assert!(url.ends_with(".png"));
        assert_eq!(card.render_error, None);
    }

    assert_eq!(h.slides.container_names(), vec!["Green Co-[1] (1)".to_string()]);
    assert_eq!(h.slides.slots("container-1").len(), 10);
    assert_eq!(h.objects.keys.lock().unwrap().len(), 10);
}

#[tokio::test]
async fn test_cards_pluralize_per_recipient() {
    let h = memory_harness(FakeSlides::default(), &config(200)).await;
    h.services.lifecycle.process(1).await.unwrap();

    let records = h.slides.records();
    assert_eq!(records.len(), 10);
    let asha: Vec<&SlotRecord> = records.iter().filter(|record| record.recipient_name == "Asha").collect();
    assert_eq!(asha.len(), 3);
    assert!(asha.iter().all(|record| record.primary_message.contains("3 trees")));
    let guest: Vec<&SlotRecord> = records.iter().filter(|record| record.recipient_name == "Guest").collect();
    assert!(guest.iter().all(|record| record.primary_message.contains("7 trees")));
}

#[tokio::test]
async fn test_generation_splits_into_batches() {
    let h = memory_harness(FakeSlides::default(), &config(4)).await;

    h.services.allocator.auto_reserve(1).await.unwrap();
    h.services.lifecycle.mark_reserved(1).await.unwrap();
    h.services.assignment.auto_assign(1).await.unwrap();
    h.services.lifecycle.mark_assigned(1).await.unwrap();

    let report = h.services.pipeline.generate_for_request(1).await.unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.rendered, 10);
    assert_eq!(report.failed, 0);
    assert_eq!(report.status, Some(RequestStatus::Completed));
    assert_eq!(
        h.slides.container_names(),
        vec![
            "Green Co-[1] (1)".to_string(),
            "Green Co-[1] (2)".to_string(),
            "Green Co-[1] (3)".to_string(),
        ]
    );
    assert_eq!(h.slides.slots("container-3").len(), 2);
}

#[tokio::test]
async fn test_fallback_thumbnails_record_retries() {
    let slides = FakeSlides {
        fail_export: true,
        thumbnail_failures: 2,
        ..FakeSlides::default()
    };
    let h = memory_harness(slides, &config(200)).await;

    let status = h.services.lifecycle.process(1).await.unwrap();
    assert_eq!(status, RequestStatus::Completed);

    let cards = h.store.list_cards(1).await.unwrap();
    assert_eq!(cards.len(), 10);
    for card in &cards {
        assert!(card.image_url.is_some());
        assert_eq!(card.render_error, None);
        assert_eq!(card.render_retries, 2);
    }
}

#[tokio::test]
async fn test_exhausted_fallback_still_completes() {
    let slides = FakeSlides {
        fail_export: true,
        thumbnail_failures: 10,
        ..FakeSlides::default()
    };
    let h = memory_harness(slides, &config(200)).await;

    let status = h.services.lifecycle.process(1).await.unwrap();
    assert_eq!(status, RequestStatus::Completed);

    let cards = h.store.list_cards(1).await.unwrap();
    for card in &cards {
        assert_eq!(card.image_url, None);
        assert!(card.render_error.as_deref().unwrap().contains("thumbnail not ready"));
        assert_eq!(card.render_retries, 2);
    }
    let request = h.store.get_request(1).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
}

#[tokio::test]
async fn test_missing_template_is_recorded() {
    let store: Arc<dyn TreeStore> = Arc::new(MemoryTreeStore::new());
    seed(store.as_ref()).await;
    store.insert_units(&[TreeUnit::new(20, 3, "Peepal")]).await.unwrap();
    let mut request = store.get_request(1).await.unwrap().unwrap();
    request.pledged_count = 11;
    request.plots.push(PlotDemand::new(3, 1));
    store.insert_request(&request).await.unwrap();
    let mut extra = RecipientQuota::new(3, 1, 300, 1);
    extra.recipient_name = "Meera".into();
    store.upsert_quota(&extra).await.unwrap();

    let h = harness(store, FakeSlides::default(), &config(200));
    assert_eq!(h.services.lifecycle.process(1).await.unwrap(), RequestStatus::Completed);

    let cards = h.store.list_cards(1).await.unwrap();
    assert_eq!(cards.len(), 11);
    let peepal = cards.iter().find(|card| card.unit_id == 20).unwrap();
    assert_eq!(peepal.render_error.as_deref(), Some(NO_TEMPLATE_ERROR));
    assert_eq!(peepal.image_url, None);
    assert_eq!(cards.iter().filter(|card| card.image_url.is_some()).count(), 10);
}

#[tokio::test]
async fn test_overbooking_is_rejected() {
    let h = memory_harness(FakeSlides::default(), &config(200)).await;

    let ids: Vec<i64> = (1..=11).collect();
    let err = h.services.allocator.reserve_exact(1, &ids).await.unwrap_err();
    assert!(matches!(
        err,
        FulfillmentError::Overbooking {
            requested: 11,
            already_reserved: 0,
            pledged: 10
        }
    ));
    assert!(h.store.list_request_units(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_partial_plots_stop_before_reserved() {
    let store: Arc<dyn TreeStore> = Arc::new(MemoryTreeStore::new());
    seed(store.as_ref()).await;
    let mut request = store.get_request(1).await.unwrap().unwrap();
    request.plots = vec![PlotDemand::new(2, 10)];
    store.insert_request(&request).await.unwrap();

    let h = harness(store, FakeSlides::default(), &config(200));
    let status = h.services.lifecycle.process(1).await.unwrap();
    assert_eq!(status, RequestStatus::PendingPlotSelection);

    let stats = h.services.allocator.reservation_stats(1).await.unwrap();
    assert_eq!(stats.already_reserved, 5);
    assert_eq!(stats.remaining, 5);
}

#[tokio::test]
async fn test_notifications_skip_placeholder_addresses() {
    let h = memory_harness(FakeSlides::default(), &config(200)).await;
    h.services.lifecycle.process(1).await.unwrap();

    let options = NotificationOptions {
        attach_cards: true,
        ..NotificationOptions::default()
    };
    let report = h
        .services
        .notifications
        .send_recipient_notifications(1, &options)
        .await
        .unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.skipped, 1);

    let mails = h.notifier.mails.lock().unwrap().clone();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].template, MULTI_TREE_TEMPLATE);
    assert_eq!(mails[0].to, vec!["asha@example.org".to_string()]);
    assert_eq!(mails[0].data.count, 3);
    assert_eq!(mails[0].attachments.len(), 3);

    let quotas = h.store.read_quotas(1).await.unwrap();
    assert!(quotas.iter().find(|quota| quota.id == 1).unwrap().mail_sent);
    assert!(!quotas.iter().find(|quota| quota.id == 2).unwrap().mail_sent);

    // Already notified quotas are not mailed again
    let again = h
        .services
        .notifications
        .send_recipient_notifications(1, &options)
        .await
        .unwrap();
    assert_eq!(again.sent, 0);
}

#[tokio::test]
async fn test_short_slot_list_fails_the_batch() {
    let slides = FakeSlides {
        short_slots: true,
        ..FakeSlides::default()
    };
    let h = memory_harness(slides, &config(200)).await;

    h.services.allocator.auto_reserve(1).await.unwrap();
    h.services.lifecycle.mark_reserved(1).await.unwrap();
    h.services.assignment.auto_assign(1).await.unwrap();
    h.services.lifecycle.mark_assigned(1).await.unwrap();

    let report = h.services.pipeline.generate_for_request(1).await.unwrap();
    assert_eq!(report.rendered, 0);
    assert_eq!(report.failed, 10);
    assert_eq!(report.status, Some(RequestStatus::Completed));

    let cards = h.store.list_cards(1).await.unwrap();
    assert_eq!(cards.len(), 10);
    for card in &cards {
        assert_eq!(card.image_url, None);
        assert!(card.render_error.as_deref().unwrap().contains("created 9 slots for 10 cards"));
    }
}

/// Request 1 reduced to seven single-tree recipients with real addresses
async fn seven_recipient_harness() -> Harness {
    let store: Arc<dyn TreeStore> = Arc::new(MemoryTreeStore::new());
    seed(store.as_ref()).await;
    store.delete_quotas(1, &[1, 2]).await.unwrap();
    let mut request = store.get_request(1).await.unwrap().unwrap();
    request.pledged_count = 7;
    request.plots = vec![PlotDemand::new(1, 7)];
    store.insert_request(&request).await.unwrap();
    for n in 0..7 {
        let mut quota = RecipientQuota::new(10 + n, 1, 100 + n, 1);
        quota.recipient_name = format!("Person {}", n);
        quota.assignee_name = quota.recipient_name.clone();
        quota.recipient_email = Some(format!("person{}@example.org", n));
        store.upsert_quota(&quota).await.unwrap();
    }

    let h = harness(store, FakeSlides::default(), &config(200));
    assert_eq!(h.services.lifecycle.process(1).await.unwrap(), RequestStatus::Completed);
    h
}

#[tokio::test]
async fn test_test_mode_notifications_are_capped_and_not_marked() {
    let h = seven_recipient_harness().await;

    let options = NotificationOptions {
        test_recipients: vec!["qa@example.org".into()],
        ..NotificationOptions::default()
    };
    let report = h
        .services
        .notifications
        .send_recipient_notifications(1, &options)
        .await
        .unwrap();
    assert_eq!(report.groups, 5);
    assert_eq!(report.sent, 5);

    let mails = h.notifier.mails.lock().unwrap().clone();
    assert_eq!(mails.len(), 5);
    assert!(mails.iter().all(|mail| mail.to == vec!["qa@example.org".to_string()]));

    let quotas = h.store.read_quotas(1).await.unwrap();
    assert_eq!(quotas.len(), 7);
    assert!(quotas.iter().all(|quota| !quota.mail_sent));
}

#[tokio::test]
async fn test_rejected_notifications_record_mail_error() {
    let h = memory_harness(FakeSlides::default(), &config(200)).await;
    h.services.lifecycle.process(1).await.unwrap();
    *h.notifier.reject.lock().unwrap() = Some("mailbox full".into());

    let report = h
        .services
        .notifications
        .send_recipient_notifications(1, &NotificationOptions::default())
        .await
        .unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(report.failed, 1);
    // Rejections are final, not retried
    assert_eq!(h.notifier.mails.lock().unwrap().len(), 1);

    let quotas = h.store.read_quotas(1).await.unwrap();
    let asha = quotas.iter().find(|quota| quota.id == 1).unwrap();
    assert!(!asha.mail_sent);
    assert_eq!(asha.mail_error.as_deref(), Some("mailbox full"));
}

#[tokio::test]
async fn test_process_on_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn TreeStore> = Arc::new(SqliteTreeStore::open(&dir.path().join("fulfillment.db")).unwrap());
    seed(store.as_ref()).await;

    let h = harness(store, FakeSlides::default(), &config(200));
    assert_eq!(h.services.lifecycle.process(1).await.unwrap(), RequestStatus::Completed);

    let cards = h.store.list_cards(1).await.unwrap();
    assert_eq!(cards.len(), 10);
    assert!(cards.iter().all(|card| card.image_url.is_some()));
    let stats = h.services.allocator.reservation_stats(1).await.unwrap();
    assert_eq!(stats.remaining, 0);
}
