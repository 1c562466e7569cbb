//! Slide templating service seam
//!
//! A card container is a copy of the template deck. It holds one template
//! slot per plant type until the pipeline creates per-unit slots from them and
//! removes the originals.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FulfillmentError, Result};

/// Personalized text fields of one card slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub slot_id: String,
    pub recipient_name: String,
    /// Sapling label printed on the card
    pub sapling: String,
    pub primary_message: String,
    pub secondary_message: String,
    pub logo_url: Option<String>,
    pub logo_message: String,
}

#[async_trait]
pub trait SlideService: Send + Sync {
    /// Copy a template container, returning the new container id
    async fn duplicate_container(&self, template_id: &str, name: &str) -> Result<String>;

    /// Create one slot per entry by copying the given template slots, in order
    async fn create_slots(&self, container_id: &str, template_slot_ids: &[String]) -> Result<Vec<String>>;

    async fn bulk_update_slots(&self, container_id: &str, records: &[SlotRecord]) -> Result<()>;

    /// Slot ids currently in the container, in display order
    async fn list_slots(&self, container_id: &str) -> Result<Vec<String>>;

    async fn delete_slots(&self, container_id: &str, slot_ids: &[String]) -> Result<()>;

    async fn reorder_slots(&self, container_id: &str, slot_ids: &[String]) -> Result<()>;

    /// Export the whole container as one document
    async fn export_as_document(&self, container_id: &str, mime_type: &str) -> Result<Bytes>;

    /// URL of a rendered thumbnail of one slot
    async fn export_slot_thumbnail(&self, container_id: &str, slot_id: &str) -> Result<String>;
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Serialize)]
struct CopyContainerBody<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct ContainerResponse {
    id: String,
}

#[derive(Serialize)]
struct SlotIdsBody<'a> {
    slot_ids: &'a [String],
}

#[derive(Serialize)]
struct CreateSlotsBody<'a> {
    template_slot_ids: &'a [String],
}

#[derive(Deserialize)]
struct SlotIdsResponse {
    slot_ids: Vec<String>,
}

#[derive(Serialize)]
struct RecordsBody<'a> {
    records: &'a [SlotRecord],
}

#[derive(Deserialize)]
struct ThumbnailResponse {
    content_url: String,
}

/// Slide service reached over its REST API
pub struct HttpSlideService {
    base_url: String,
    client: Client,
}

impl HttpSlideService {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| FulfillmentError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn container_url(&self, container_id: &str, suffix: &str) -> String {
        format!(
            "{}/containers/{}{}",
            self.base_url,
            urlencoding::encode(container_id),
            suffix
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FulfillmentError::NotFound(response.url().to_string()));
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(FulfillmentError::External(format!(
                "slide service returned {}: {}",
                status, body
            )));
        }

        Ok(response)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let body = Self::check(response).await?.json().await?;
        Ok(body)
    }
}

#[async_trait]
impl SlideService for HttpSlideService {
    async fn duplicate_container(&self, template_id: &str, name: &str) -> Result<String> {
        let response = self
            .client
            .post(self.container_url(template_id, "/copy"))
            .json(&CopyContainerBody { name })
            .send()
            .await?;
        let created: ContainerResponse = Self::handle_response(response).await?;
        Ok(created.id)
    }

    async fn create_slots(&self, container_id: &str, template_slot_ids: &[String]) -> Result<Vec<String>> {
        let response = self
            .client
            .post(self.container_url(container_id, "/slots"))
            .json(&CreateSlotsBody { template_slot_ids })
            .send()
            .await?;
        let created: SlotIdsResponse = Self::handle_response(response).await?;

        if created.slot_ids.len() != template_slot_ids.len() {
            return Err(FulfillmentError::External(format!(
                "slide service created {} slots, expected {}",
                created.slot_ids.len(),
                template_slot_ids.len()
            )));
        }
        Ok(created.slot_ids)
    }

    async fn bulk_update_slots(&self, container_id: &str, records: &[SlotRecord]) -> Result<()> {
        let response = self
            .client
            .patch(self.container_url(container_id, "/slots"))
            .json(&RecordsBody { records })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list_slots(&self, container_id: &str) -> Result<Vec<String>> {
        let response = self.client.get(self.container_url(container_id, "/slots")).send().await?;
        let listed: SlotIdsResponse = Self::handle_response(response).await?;
        Ok(listed.slot_ids)
    }

    async fn delete_slots(&self, container_id: &str, slot_ids: &[String]) -> Result<()> {
        if slot_ids.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .delete(self.container_url(container_id, "/slots"))
            .json(&SlotIdsBody { slot_ids })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn reorder_slots(&self, container_id: &str, slot_ids: &[String]) -> Result<()> {
        let response = self
            .client
            .put(self.container_url(container_id, "/slots/order"))
            .json(&SlotIdsBody { slot_ids })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn export_as_document(&self, container_id: &str, mime_type: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(self.container_url(container_id, "/export"))
            .header(header::ACCEPT, mime_type)
            .send()
            .await?;
        Ok(Self::check(response).await?.bytes().await?)
    }

    async fn export_slot_thumbnail(&self, container_id: &str, slot_id: &str) -> Result<String> {
        let suffix = format!("/slots/{}/thumbnail", urlencoding::encode(slot_id));
        let response = self
            .client
            .get(self.container_url(container_id, &suffix))
            .send()
            .await?;
        let thumbnail: ThumbnailResponse = Self::handle_response(response).await?;
        Ok(thumbnail.content_url)
    }
}
