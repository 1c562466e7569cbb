//! Card generation pipeline
//!
//! Cards are rendered in batches, one duplicated template container per
//! batch. Each batch is exported as one PDF and split into page images. If
//! that fails, every card of the batch is rendered from its own slot
//! thumbnail instead, with retries.
//!
//! Render failures are recorded on the card and never fail the request. Store
//! failures always propagate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::concurrency::run_with_concurrency;
use crate::db::TreeStore;
use crate::error::{FulfillmentError, Result};
use crate::models::{
    current_timestamp, CardArtifact, RecipientQuota, RequestStatus, ReservationRequest, TreeUnit,
};
use crate::object_store::{card_image_key, ObjectStore};
use crate::rasterize::Rasterizer;
use crate::retry::{Exhausted, Retried, RetryPolicy};
use crate::services::events::{EventBus, FulfillmentEvent};
use crate::services::lifecycle::transition;
use crate::slides::{SlideService, SlotRecord};

use super::batch::{chunk, tally, DEFAULT_BATCH_SIZE};
use super::message::{personalize, Addressee, Personalization};

/// Render error recorded on cards whose plant type has no template slot
pub const NO_TEMPLATE_ERROR: &str = "no template for plant type";

const PDF_MIME: &str = "application/pdf";

/// Tunables of the card pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Container holding one template slot per plant type
    pub template_container_id: String,
    pub batch_size: usize,
    pub container_copies: usize,
    pub image_status_writes: usize,
    pub fallback_renders: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            template_container_id: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            container_copies: 10,
            image_status_writes: 20,
            fallback_renders: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one generation run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationReport {
    pub batches: usize,
    pub rendered: usize,
    pub failed: usize,
    /// Cards without a template for their plant type
    pub skipped: usize,
    pub status: Option<RequestStatus>,
}

/// A card with everything needed to render it
#[derive(Debug, Clone)]
struct CardJob {
    card: CardArtifact,
    unit: TreeUnit,
    quota: Option<RecipientQuota>,
    template_slot: String,
}

impl CardJob {
    fn pair(&self) -> Option<(i64, i64)> {
        self.unit.assigned_recipient.zip(self.unit.assigned_assignee)
    }

    fn image_key(&self, request: &ReservationRequest) -> String {
        card_image_key(&request.request_key, &self.unit.sapling_id)
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    rendered: usize,
    failed: usize,
}

pub struct ArtifactBatchPipeline {
    store: Arc<dyn TreeStore>,
    slides: Arc<dyn SlideService>,
    objects: Arc<dyn ObjectStore>,
    rasterizer: Arc<dyn Rasterizer>,
    events: Arc<EventBus>,
    options: PipelineOptions,
}

impl ArtifactBatchPipeline {
    pub fn new(
        store: Arc<dyn TreeStore>,
        slides: Arc<dyn SlideService>,
        objects: Arc<dyn ObjectStore>,
        rasterizer: Arc<dyn Rasterizer>,
        events: Arc<EventBus>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            slides,
            objects,
            rasterizer,
            events,
            options,
        }
    }

    // =========================================================================
    // Card bookkeeping
    // =========================================================================

    /// Create missing cards for assigned units and return the request's cards.
    ///
    /// Cards come back ordered by quota id, cards without a quota last.
    pub async fn ensure_cards(
        &self,
        request: &ReservationRequest,
        units: &[TreeUnit],
        quotas: &[RecipientQuota],
    ) -> Result<Vec<CardArtifact>> {
        let existing: HashMap<i64, CardArtifact> = self
            .store
            .list_cards(request.id)
            .await?
            .into_iter()
            .map(|card| (card.unit_id, card))
            .collect();

        let mut created = 0;
        for unit in units.iter().filter(|unit| unit.is_assigned()) {
            let quota_id = quotas.iter().find(|quota| quota.owns(unit)).map(|quota| quota.id);
            match existing.get(&unit.id) {
                None => {
                    self.store.insert_card(request.id, unit.id, quota_id).await?;
                    created += 1;
                }
                Some(card) if card.quota_id != quota_id => {
                    let mut card = card.clone();
                    card.quota_id = quota_id;
                    card.updated_at = current_timestamp();
                    self.store.update_card(&card).await?;
                }
                Some(_) => {}
            }
        }
        if created > 0 {
            debug!(request_id = request.id, created = created, "Created card records");
        }

        let mut cards = self.store.list_cards(request.id).await?;
        cards.sort_by_key(|card| (card.quota_id.is_none(), card.quota_id, card.unit_id));
        Ok(cards)
    }

    async fn collect_jobs(
        &self,
        request: &ReservationRequest,
        report: &mut GenerationReport,
    ) -> Result<Vec<CardJob>> {
        let units = self.store.list_request_units(request.id).await?;
        let quotas = self.store.read_quotas(request.id).await?;
        let cards = self.ensure_cards(request, &units, &quotas).await?;
        let templates = self.store.template_slots().await?;

        let units_by_id: HashMap<i64, &TreeUnit> = units.iter().map(|unit| (unit.id, unit)).collect();
        let mut jobs = Vec::with_capacity(cards.len());

        for mut card in cards {
            let Some(unit) = units_by_id.get(&card.unit_id).filter(|unit| unit.is_assigned()) else {
                continue;
            };
            match templates.get(&unit.plant_type) {
                Some(template_slot) => jobs.push(CardJob {
                    quota: card
                        .quota_id
                        .and_then(|id| quotas.iter().find(|quota| quota.id == id).cloned()),
                    card,
                    unit: (*unit).clone(),
                    template_slot: template_slot.clone(),
                }),
                None => {
                    warn!(
                        request_id = request.id,
                        unit_id = unit.id,
                        plant_type = %unit.plant_type,
                        "No card template for plant type, skipping"
                    );
                    card.render_error = Some(NO_TEMPLATE_ERROR.to_string());
                    card.updated_at = current_timestamp();
                    self.store.update_card(&card).await?;
                    self.events.emit(FulfillmentEvent::CardRenderFailed {
                        request_id: request.id,
                        unit_id: unit.id,
                        error: NO_TEMPLATE_ERROR.to_string(),
                    });
                    report.skipped += 1;
                }
            }
        }

        Ok(jobs)
    }

    // =========================================================================
    // Generation
    // =========================================================================

    /// Render one card per assigned unit of the request.
    ///
    /// A request in `pending_artifacts` advances to `completed` afterwards,
    /// whatever the number of failed cards.
    pub async fn generate_for_request(&self, request_id: i64) -> Result<GenerationReport> {
        let started = Instant::now();
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| FulfillmentError::NotFound(format!("request {}", request_id)))?;

        let mut report = GenerationReport::default();
        let jobs = self.collect_jobs(&request, &mut report).await?;

        if !jobs.is_empty() {
            let batches = chunk(&jobs, self.options.batch_size);
            report.batches = batches.len();

            let copy_started = Instant::now();
            let containers = self.duplicate_containers(&request, batches.len()).await?;
            info!(
                request_id = request_id,
                containers = containers.len(),
                duration_ms = copy_started.elapsed().as_millis() as u64,
                "Duplicated card containers"
            );

            for (index, (batch, container_id)) in batches.into_iter().zip(containers).enumerate() {
                let outcome = self.process_batch(&request, index, &container_id, batch).await?;
                report.rendered += outcome.rendered;
                report.failed += outcome.failed;
            }
        }

        let current = self
            .store
            .get_request(request_id)
            .await?
            .map(|request| request.status)
            .unwrap_or(request.status);
        if current == RequestStatus::PendingArtifacts {
            transition(
                self.store.as_ref(),
                &self.events,
                request_id,
                current,
                RequestStatus::Completed,
            )
            .await?;
            report.status = Some(RequestStatus::Completed);
        } else {
            report.status = Some(current);
        }

        info!(
            request_id = request_id,
            batches = report.batches,
            rendered = report.rendered,
            failed = report.failed,
            skipped = report.skipped,
            duration_ms = started.elapsed().as_millis() as u64,
            "Card generation finished"
        );
        Ok(report)
    }

    async fn duplicate_containers(&self, request: &ReservationRequest, count: usize) -> Result<Vec<String>> {
        let tasks: Vec<_> = (0..count)
            .map(|batch| {
                let slides = self.slides.clone();
                let template_id = self.options.template_container_id.clone();
                let name = request.container_name(batch);
                move || async move { slides.duplicate_container(&template_id, &name).await }
            })
            .collect();

        run_with_concurrency(tasks, self.options.container_copies).await
    }

    async fn process_batch(
        &self,
        request: &ReservationRequest,
        index: usize,
        container_id: &str,
        batch: &[CardJob],
    ) -> Result<BatchOutcome> {
        let started = Instant::now();
        info!(request_id = request.id, batch = index + 1, cards = batch.len(), "Batch start");

        let slot_ids = match self.prepare_batch(request, container_id, batch).await {
            Ok(slot_ids) => slot_ids,
            Err(e) => {
                warn!(request_id = request.id, batch = index + 1, error = %e, "Batch setup failed");
                let failed: Vec<CardArtifact> = batch
                    .iter()
                    .map(|job| {
                        let mut card = job.card.clone();
                        card.container_id = Some(container_id.to_string());
                        card.render_error = Some(e.to_string());
                        card.updated_at = current_timestamp();
                        card
                    })
                    .collect();
                self.write_cards(request.id, failed).await?;
                return Ok(BatchOutcome {
                    rendered: 0,
                    failed: batch.len(),
                });
            }
        };
        debug!(
            request_id = request.id,
            batch = index + 1,
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch slots prepared"
        );

        let cards: Vec<CardArtifact> = batch
            .iter()
            .zip(&slot_ids)
            .map(|(job, slot_id)| {
                let mut card = job.card.clone();
                card.slide_id = Some(slot_id.clone());
                card.container_id = Some(container_id.to_string());
                card
            })
            .collect();

        let outcome = match self.render_primary(request, container_id, batch).await {
            Ok(urls) => {
                let rendered: Vec<CardArtifact> = cards
                    .into_iter()
                    .zip(urls)
                    .map(|(mut card, url)| {
                        card.image_url = Some(url);
                        card.render_error = None;
                        card.render_retries = 0;
                        card.updated_at = current_timestamp();
                        card
                    })
                    .collect();
                self.write_cards(request.id, rendered).await?
            }
            Err(e) => {
                warn!(
                    request_id = request.id,
                    batch = index + 1,
                    error = %e,
                    "Document render failed, falling back to per-card thumbnails"
                );
                self.render_fallback(request, container_id, batch, cards).await?
            }
        };

        info!(
            request_id = request.id,
            batch = index + 1,
            rendered = outcome.rendered,
            failed = outcome.failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch end"
        );
        Ok(outcome)
    }

    /// Create, fill, prune and order the batch's slots. Returns slot ids in card order.
    async fn prepare_batch(
        &self,
        request: &ReservationRequest,
        container_id: &str,
        batch: &[CardJob],
    ) -> Result<Vec<String>> {
        let template_ids: Vec<String> = batch.iter().map(|job| job.template_slot.clone()).collect();
        let slot_ids = self.slides.create_slots(container_id, &template_ids).await?;
        if slot_ids.len() != batch.len() {
            return Err(FulfillmentError::External(format!(
                "created {} slots for {} cards",
                slot_ids.len(),
                batch.len()
            )));
        }

        let pair_counts = tally(batch, CardJob::pair);
        let records: Vec<SlotRecord> = batch
            .iter()
            .zip(&slot_ids)
            .map(|(job, slot_id)| slot_record(request, job, slot_id, &pair_counts))
            .collect();
        self.slides.bulk_update_slots(container_id, &records).await?;

        let keep: HashSet<&String> = slot_ids.iter().collect();
        let unused: Vec<String> = self
            .slides
            .list_slots(container_id)
            .await?
            .into_iter()
            .filter(|slot_id| !keep.contains(slot_id))
            .collect();
        self.slides.delete_slots(container_id, &unused).await?;
        self.slides.reorder_slots(container_id, &slot_ids).await?;

        Ok(slot_ids)
    }

    /// Export the container once and upload one page per card
    async fn render_primary(
        &self,
        request: &ReservationRequest,
        container_id: &str,
        batch: &[CardJob],
    ) -> Result<Vec<String>> {
        let document = self.slides.export_as_document(container_id, PDF_MIME).await?;
        let pages = self.rasterizer.split_pages(document).await?;
        if pages.len() != batch.len() {
            return Err(FulfillmentError::External(format!(
                "exported document has {} pages, expected {}",
                pages.len(),
                batch.len()
            )));
        }

        let tasks: Vec<_> = pages
            .into_iter()
            .zip(batch)
            .map(|(page, job)| {
                let objects = self.objects.clone();
                let key = job.image_key(request);
                move || async move { objects.upload(page, &key).await }
            })
            .collect();

        run_with_concurrency(tasks, self.options.image_status_writes).await
    }

    /// Render each card from its slot thumbnail, retrying transient failures
    async fn render_fallback(
        &self,
        request: &ReservationRequest,
        container_id: &str,
        batch: &[CardJob],
        cards: Vec<CardArtifact>,
    ) -> Result<BatchOutcome> {
        let tasks: Vec<_> = cards
            .into_iter()
            .zip(batch)
            .map(|(mut card, job)| {
                let slides = self.slides.clone();
                let objects = self.objects.clone();
                let store = self.store.clone();
                let retry = self.options.retry;
                let container_id = container_id.to_string();
                let slot_id = card.slide_id.clone().unwrap_or_default();
                let key = job.image_key(request);

                move || async move {
                    let outcome = retry
                        .run(|_| {
                            let slides = slides.clone();
                            let objects = objects.clone();
                            let container_id = container_id.clone();
                            let slot_id = slot_id.clone();
                            let key = key.clone();
                            async move {
                                let thumbnail = slides.export_slot_thumbnail(&container_id, &slot_id).await?;
                                objects.mirror(&thumbnail, &key).await
                            }
                        })
                        .await;

                    match outcome {
                        Ok(Retried { value, retries }) => {
                            card.image_url = Some(value);
                            card.render_error = None;
                            card.render_retries = retries;
                        }
                        Err(Exhausted { error, attempts }) => {
                            card.render_error = Some(error.to_string());
                            card.render_retries = attempts.saturating_sub(1);
                        }
                    }
                    card.updated_at = current_timestamp();
                    store.update_card(&card).await?;
                    Ok(card)
                }
            })
            .collect();

        let cards = run_with_concurrency(tasks, self.options.fallback_renders).await?;
        Ok(self.announce(request.id, &cards))
    }

    /// Persist card states and emit their render events
    async fn write_cards(&self, request_id: i64, cards: Vec<CardArtifact>) -> Result<BatchOutcome> {
        let tasks: Vec<_> = cards
            .into_iter()
            .map(|card| {
                let store = self.store.clone();
                move || async move {
                    store.update_card(&card).await?;
                    Ok(card)
                }
            })
            .collect();

        let cards = run_with_concurrency(tasks, self.options.image_status_writes).await?;
        Ok(self.announce(request_id, &cards))
    }

    fn announce(&self, request_id: i64, cards: &[CardArtifact]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for card in cards {
            match (&card.image_url, &card.render_error) {
                (Some(url), None) => {
                    outcome.rendered += 1;
                    self.events.emit(FulfillmentEvent::CardRendered {
                        request_id,
                        unit_id: card.unit_id,
                        image_url: url.clone(),
                    });
                }
                (_, error) => {
                    outcome.failed += 1;
                    self.events.emit(FulfillmentEvent::CardRenderFailed {
                        request_id,
                        unit_id: card.unit_id,
                        error: error.clone().unwrap_or_default(),
                    });
                }
            }
        }
        outcome
    }
}

/// Personalized slot contents for one card
fn slot_record(
    request: &ReservationRequest,
    job: &CardJob,
    slot_id: &str,
    pair_counts: &HashMap<(i64, i64), usize>,
) -> SlotRecord {
    let pair = job.pair();
    let addressee = match (pair, job.quota.as_ref()) {
        (Some((recipient, assignee)), Some(quota)) if recipient != assignee && !quota.assignee_name.trim().is_empty() => {
            Some(Addressee {
                name: &quota.assignee_name,
                relation: quota.relation.as_deref(),
            })
        }
        _ => None,
    };
    let tree_count = pair.and_then(|pair| pair_counts.get(&pair).copied()).unwrap_or(1);

    SlotRecord {
        slot_id: slot_id.to_string(),
        recipient_name: job
            .quota
            .as_ref()
            .map(|quota| quota.recipient_name.clone())
            .unwrap_or_default(),
        sapling: job.unit.sapling_id.clone(),
        primary_message: personalize(
            &request.primary_message,
            &Personalization {
                event_type: request.event_type.as_deref(),
                addressee,
                tree_count,
            },
        ),
        secondary_message: request.secondary_message.clone(),
        logo_url: request.logo_url.clone(),
        logo_message: request.logo_message.clone(),
    }
}
