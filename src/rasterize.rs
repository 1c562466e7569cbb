//! Splits an exported card document into one PNG per page

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{FulfillmentError, Result};

#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Render every page of a PDF document, in page order
    async fn split_pages(&self, document: Bytes) -> Result<Vec<Bytes>>;
}

/// Rasterizer driving a Ghostscript-compatible command line tool
pub struct CommandRasterizer {
    program: String,
    resolution_dpi: u32,
    work_dir: PathBuf,
}

impl CommandRasterizer {
    pub fn new(program: impl Into<String>, resolution_dpi: u32) -> Self {
        Self {
            program: program.into(),
            resolution_dpi,
            work_dir: std::env::temp_dir(),
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    fn args(&self, input: &str, output_pattern: &str) -> Vec<String> {
        vec![
            "-dNOPAUSE".into(),
            "-dBATCH".into(),
            "-dSAFER".into(),
            "-sDEVICE=png16m".into(),
            format!("-r{}", self.resolution_dpi),
            format!("-sOutputFile={}", output_pattern),
            input.into(),
        ]
    }

    async fn render_in(&self, dir: &std::path::Path, document: &[u8]) -> Result<Vec<Bytes>> {
        let input = dir.join("cards.pdf");
        fs::write(&input, document).await?;
        let pattern = dir.join("page-%04d.png");

        let output = Command::new(&self.program)
            .args(self.args(&input.to_string_lossy(), &pattern.to_string_lossy()))
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(FulfillmentError::External(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut pages = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("page-") && name.ends_with(".png") {
                pages.push((name, entry.path()));
            }
        }
        // zero padded names sort in page order
        pages.sort();

        let mut images = Vec::with_capacity(pages.len());
        for (_, path) in pages {
            images.push(Bytes::from(fs::read(&path).await?));
        }
        Ok(images)
    }
}

#[async_trait]
impl Rasterizer for CommandRasterizer {
    async fn split_pages(&self, document: Bytes) -> Result<Vec<Bytes>> {
        let dir = self
            .work_dir
            .join(format!("grove-raster-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir).await?;

        let result = self.render_in(&dir, &document).await;

        if let Err(e) = fs::remove_dir_all(&dir).await {
            warn!(path = %dir.display(), error = %e, "Failed to clean up rasterizer work dir");
        }
        if let Ok(ref pages) = result {
            debug!(pages = pages.len(), bytes = document.len(), "Rasterized document");
        }
        result
    }
}
