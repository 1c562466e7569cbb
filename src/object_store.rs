//! Object storage for rendered card images
//!
//! Images are stored under `{request_key}/{sapling}.png` and addressed by a
//! public URL.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{FulfillmentError, Result};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, returning its public URL
    async fn upload(&self, bytes: Bytes, key: &str) -> Result<String>;

    /// Copy the object at `source_url` under `key`, returning its public URL
    async fn mirror(&self, source_url: &str, key: &str) -> Result<String>;
}

/// Storage key of a card image
pub fn card_image_key(request_key: &str, sapling: &str) -> String {
    format!("{}/{}.png", request_key, sapling)
}

/// Object store backed by a local directory served under `public_base_url`
pub struct FsObjectStore {
    root_dir: PathBuf,
    public_base_url: String,
    client: Client,
}

impl FsObjectStore {
    /// Create a new object store at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P, public_base_url: impl Into<String>) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), "Initialized object store");

        Ok(Self {
            root_dir,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(FulfillmentError::Validation(format!("Invalid object key: {}", key)));
        }
        Ok(self.root_dir.join(relative))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(&self, bytes: Bytes, key: &str) -> Result<String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &bytes).await?;

        debug!(key = %key, size = bytes.len(), "Stored object");
        Ok(self.public_url(key))
    }

    async fn mirror(&self, source_url: &str, key: &str) -> Result<String> {
        let response = self.client.get(source_url).send().await?;
        if !response.status().is_success() {
            return Err(FulfillmentError::External(format!(
                "fetching {} returned {}",
                source_url,
                response.status().as_u16()
            )));
        }
        let bytes = response.bytes().await?;
        self.upload(bytes, key).await
    }
}
