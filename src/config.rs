//! Configuration for grove-fulfillment

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cards::pipeline::PipelineOptions;
use crate::retry::RetryPolicy;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("grove-fulfillment")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database and rendered card images
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// SQLite database file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Public URL under which the card image directory is served
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Base URL of the slide templating service
    #[serde(default = "default_slides_api_url")]
    pub slides_api_url: String,

    /// Container holding one template slot per plant type
    #[serde(default)]
    pub template_container_id: String,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Cards per duplicated container
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    // Concurrency limits per call site
    #[serde(default = "default_persistence_writes")]
    pub persistence_writes: usize,

    #[serde(default = "default_image_status_writes")]
    pub image_status_writes: usize,

    #[serde(default = "default_container_copies")]
    pub container_copies: usize,

    #[serde(default = "default_fallback_renders")]
    pub fallback_renders: usize,

    #[serde(default = "default_notification_sends")]
    pub notification_sends: usize,

    /// Attempts per external call before recording a failure
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Backoff after the n-th failure is `retry_base_secs^n` seconds
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,

    /// Ghostscript-compatible program used to split exported documents
    #[serde(default = "default_rasterizer_program")]
    pub rasterizer_program: String,

    #[serde(default = "default_rasterizer_dpi")]
    pub rasterizer_dpi: u32,
}

fn default_database_file() -> String {
    "fulfillment.db".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8080/cards".to_string()
}

fn default_slides_api_url() -> String {
    "http://localhost:8070/api".to_string()
}

fn default_http_timeout() -> u64 {
    120
}

fn default_batch_size() -> usize {
    200
}

fn default_persistence_writes() -> usize {
    10
}

fn default_image_status_writes() -> usize {
    20
}

fn default_container_copies() -> usize {
    10
}

fn default_fallback_renders() -> usize {
    3
}

fn default_notification_sends() -> usize {
    2
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_secs() -> u64 {
    2
}

fn default_rasterizer_program() -> String {
    "gs".to_string()
}

fn default_rasterizer_dpi() -> u32 {
    150
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            public_base_url: default_public_base_url(),
            slides_api_url: default_slides_api_url(),
            template_container_id: String::new(),
            http_timeout_secs: default_http_timeout(),
            batch_size: default_batch_size(),
            persistence_writes: default_persistence_writes(),
            image_status_writes: default_image_status_writes(),
            container_copies: default_container_copies(),
            fallback_renders: default_fallback_renders(),
            notification_sends: default_notification_sends(),
            retry_attempts: default_retry_attempts(),
            retry_base_secs: default_retry_base_secs(),
            rasterizer_program: default_rasterizer_program(),
            rasterizer_dpi: default_rasterizer_dpi(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content =
            toml::to_string_pretty(self).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Directory served under `public_base_url`
    pub fn images_dir(&self) -> PathBuf {
        self.storage_dir.join("cards")
    }

    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_base_secs)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            template_container_id: self.template_container_id.clone(),
            batch_size: self.batch_size,
            container_copies: self.container_copies,
            image_status_writes: self.image_status_writes,
            fallback_renders: self.fallback_renders,
            retry: self.retry_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_service_limits() {
        let config = Config::default();
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.persistence_writes, 10);
        assert_eq!(config.image_status_writes, 20);
        assert_eq!(config.fallback_renders, 3);
        assert_eq!(config.notification_sends, 2);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            template_container_id = "deck-42"
            batch_size = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.template_container_id, "deck-42");
        assert_eq!(config.pipeline_options().batch_size, 50);
        assert_eq!(config.container_copies, 10);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.retry_attempts = 5;

        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}
